//! Streaming protocol client: sessions over pooled connections.

use crate::error::{DubError, Result, with_timeout};
use crate::protocol::frame::{Compression, Flags, Frame, FrameBuffer, MessageType};
use crate::protocol::pool::{ConnectionPool, PooledConnection};
use crate::protocol::session::{ProtocolSession, ServerEvent};
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Parameters for one session, sent in the opening full-client-request.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub params: serde_json::Value,
    pub compression: Compression,
}

impl SessionConfig {
    pub fn new(params: serde_json::Value) -> Self {
        Self {
            params,
            compression: Compression::None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

/// Opens sessions against one endpoint's connection pool.
#[derive(Debug, Clone)]
pub struct StreamingClient {
    pool: Arc<ConnectionPool>,
    op_timeout: Duration,
}

impl StreamingClient {
    pub fn new(pool: Arc<ConnectionPool>, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Acquire a connection and start a session with `config`.
    pub async fn open(&self, config: &SessionConfig) -> Result<SessionHandle> {
        let mut conn = self.pool.acquire().await?;
        let mut session = ProtocolSession::new(MessageType::AudioOnlyRequest);

        let frame =
            Frame::json_request(&config.params, session.next_sequence(), config.compression)?;
        let bytes = frame.encode()?;
        let sent = with_timeout(
            "session open",
            self.op_timeout,
            conn.transport()?.send(bytes),
        )
        .await;
        if let Err(e) = sent {
            conn.discard().await;
            return Err(e);
        }

        tracing::debug!(
            session_id = %session.id(),
            url = %self.pool.url(),
            reused = conn.was_reused(),
            "protocol session opened"
        );
        Ok(SessionHandle {
            conn: Some(conn),
            session,
            buffer: FrameBuffer::new(),
            pending: VecDeque::new(),
            compression: config.compression,
            op_timeout: self.op_timeout,
        })
    }
}

/// A live session. Call [`close`](Self::close) when done; dropping the
/// handle instead discards its connection.
pub struct SessionHandle {
    conn: Option<PooledConnection>,
    session: ProtocolSession,
    buffer: FrameBuffer,
    pending: VecDeque<ServerEvent>,
    compression: Compression,
    op_timeout: Duration,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session.id())
            .field("complete", &self.session.is_complete())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SessionHandle {
    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    pub fn take_audio(&mut self) -> Vec<u8> {
        self.session.take_audio()
    }

    /// Frame and send one audio chunk. The last chunk carries a negative sequence.
    pub async fn send_audio_chunk(&mut self, bytes: &[u8], is_last: bool) -> Result<()> {
        if let Some(err) = self.session.failure() {
            return Err(err);
        }
        if self.session.has_sent_last() {
            return Err(DubError::protocol("audio stream already finished"));
        }

        let (sequence, flags) = if is_last {
            (self.session.final_sequence(), Flags::NEGATIVE_SEQUENCE)
        } else {
            (self.session.next_sequence(), Flags::POSITIVE_SEQUENCE)
        };
        let frame = Frame::new(MessageType::AudioOnlyRequest, flags, bytes.to_vec())
            .with_sequence(sequence)
            .with_compression(self.compression);
        let encoded = frame.encode()?;

        let op_timeout = self.op_timeout;
        let transport = self.connection()?.transport()?;
        let result = with_timeout("frame send", op_timeout, transport.send(encoded)).await;
        if let Err(e) = &result {
            self.session.fail(e);
        }
        result
    }

    /// Wait for the next server event.
    ///
    /// An `Error` event is delivered once; after that every call returns the
    /// session's terminal error.
    pub async fn receive(&mut self) -> Result<ServerEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if let Some(err) = self.session.failure() {
                return Err(err);
            }
            if self.session.is_complete() {
                return Err(DubError::protocol("session already complete"));
            }

            let op_timeout = self.op_timeout;
            let transport = self.connection()?.transport()?;
            let received = with_timeout("frame receive", op_timeout, transport.recv()).await;
            match received {
                Ok(Some(bytes)) => self.ingest(&bytes)?,
                Ok(None) => {
                    let err = DubError::Network {
                        message: "connection closed by server".to_string(),
                    };
                    self.session.fail(&err);
                    return Err(err);
                }
                Err(e) => {
                    self.session.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Return an already-available event without waiting.
    pub fn try_receive(&mut self) -> Result<Option<ServerEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if let Some(err) = self.session.failure() {
                return Err(err);
            }
            if self.session.is_complete() {
                return Ok(None);
            }

            let transport = self.connection()?.transport()?;
            match transport.recv().now_or_never() {
                None => return Ok(None),
                Some(Ok(Some(bytes))) => self.ingest(&bytes)?,
                Some(Ok(None)) => {
                    let err = DubError::Network {
                        message: "connection closed by server".to_string(),
                    };
                    self.session.fail(&err);
                    return Err(err);
                }
                Some(Err(e)) => {
                    self.session.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    /// End the session. A cleanly completed session returns its connection
    /// to the pool; anything else closes it.
    pub async fn close(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let reusable = self.session.is_complete()
            && !self.session.is_failed()
            && self.buffer.is_empty()
            && conn.is_healthy();

        if reusable {
            conn.release();
        } else {
            if !self.session.is_complete() {
                self.session
                    .fail(&DubError::cancelled("session closed before completion"));
            }
            conn.discard().await;
        }
        tracing::debug!(session_id = %self.session.id(), reusable, "protocol session closed");
    }

    fn connection(&mut self) -> Result<&mut PooledConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DubError::protocol("session closed"))
    }

    fn ingest(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.push(bytes);
        loop {
            match self.buffer.next_frame() {
                Ok(Some(frame)) => {
                    tracing::trace!(%frame, "frame received");
                    let event = self.session.on_frame(frame);
                    self.pending.push_back(event);
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    let err: DubError = e.into();
                    self.session.fail(&err);
                    self.buffer.clear();
                    return Err(err);
                }
            }
        }
    }
}
