//! Bounded pool of persistent protocol connections.

use crate::error::{DubError, Result, with_timeout};
use crate::protocol::transport::{Connector, Credentials, FrameTransport, Handshake};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Connections to one endpoint. At most `max_connections` are checked out at
/// once; `acquire` waits for a free slot.
pub struct ConnectionPool {
    url: String,
    connector: Arc<dyn Connector>,
    credentials: Option<Credentials>,
    idle: Mutex<Vec<Box<dyn FrameTransport>>>,
    permits: Arc<Semaphore>,
    max_connections: usize,
    connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("url", &self.url)
            .field("max_connections", &self.max_connections)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        credentials: Option<Credentials>,
        max_connections: usize,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let max_connections = max_connections.max(1);
        Arc::new(Self {
            url: url.into(),
            connector,
            credentials,
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            connect_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn idle_count(&self) -> usize {
        self.idle_lock().len()
    }

    /// Check out a connection, reusing an idle one when it is still healthy.
    /// New connections perform the signed handshake.
    ///
    /// Waiting for a free slot and the handshake are each bounded by the
    /// connect timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let permits = Arc::clone(&self.permits);
        let permit = with_timeout("connection acquire", self.connect_timeout, async move {
            permits
                .acquire_owned()
                .await
                .map_err(|_| DubError::Other("connection pool closed".to_string()))
        })
        .await?;

        let reused = {
            let mut idle = self.idle_lock();
            let mut found = None;
            while let Some(transport) = idle.pop() {
                if transport.is_healthy() {
                    found = Some(transport);
                    break;
                }
            }
            found
        };

        let (transport, reused) = match reused {
            Some(transport) => (transport, true),
            None => {
                let handshake = match &self.credentials {
                    Some(credentials) => credentials.handshake(chrono::Utc::now().timestamp()),
                    None => Handshake::default(),
                };
                let transport = with_timeout(
                    "handshake",
                    self.connect_timeout,
                    self.connector.connect(&self.url, &handshake),
                )
                .await?;
                (transport, false)
            }
        };

        tracing::trace!(url = %self.url, reused, "connection checked out");
        Ok(PooledConnection {
            transport: Some(transport),
            pool: Arc::clone(self),
            _permit: permit,
            reused,
        })
    }

    fn idle_lock(&self) -> MutexGuard<'_, Vec<Box<dyn FrameTransport>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_in(&self, transport: Box<dyn FrameTransport>) {
        if transport.is_healthy() {
            self.idle_lock().push(transport);
        }
    }
}

/// A checked-out connection. Dropping it without [`release`](Self::release)
/// discards the connection.
pub struct PooledConnection {
    transport: Option<Box<dyn FrameTransport>>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
    reused: bool,
}

impl PooledConnection {
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    pub fn transport(&mut self) -> Result<&mut (dyn FrameTransport + 'static)> {
        match self.transport.as_mut() {
            Some(transport) => Ok(transport.as_mut()),
            None => Err(DubError::protocol("connection already released")),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_healthy())
    }

    /// Return the connection for reuse, or discard it if it is broken.
    pub fn release(mut self) {
        if let Some(transport) = self.transport.take() {
            self.pool.check_in(transport);
        }
    }

    /// Close the underlying connection and discard it.
    pub async fn discard(mut self) {
        if let Some(mut transport) = self.transport.take()
            && let Err(e) = transport.close().await
        {
            tracing::debug!(error = %e, "closing discarded connection failed");
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.transport.take().is_some() {
            tracing::debug!(url = %self.pool.url, "unreleased connection dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::transport::{ChannelConnector, ServerEnd};
    use tokio::sync::mpsc::UnboundedReceiver;

    type Accept = UnboundedReceiver<ServerEnd>;

    fn pool_with_timeout(
        max: usize,
        connect_timeout: Duration,
    ) -> (Arc<ConnectionPool>, ChannelConnector, Accept) {
        let (connector, accept) = ChannelConnector::new();
        let pool = ConnectionPool::new(
            "mem://speech",
            Arc::new(connector.clone()),
            Some(Credentials::new("app", "ak", "sk")),
            max,
            connect_timeout,
        );
        (pool, connector, accept)
    }

    fn pool(max: usize) -> (Arc<ConnectionPool>, ChannelConnector, Accept) {
        pool_with_timeout(max, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (pool, connector, _accept) = pool(2);
        let conn = pool.acquire().await.expect("should acquire");
        assert!(!conn.was_reused());
        conn.release();
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.acquire().await.expect("should acquire");
        assert!(conn.was_reused());
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_discarded() {
        let (pool, connector, mut accept) = pool(1);
        let conn = pool.acquire().await.expect("should acquire");
        let mut server = accept.recv().await.expect("server end");
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(server.from_client.recv().await, None, "peer should see disconnect");

        let conn = pool.acquire().await.expect("should acquire");
        assert!(!conn.was_reused());
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let (pool, _connector, _accept) = pool(1);
        let first = pool.acquire().await.expect("should acquire");

        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err(), "second acquire should wait for a free slot");

        first.release();
        let second = tokio::time::timeout(Duration::from_millis(500), pool.acquire())
            .await
            .expect("slot should free up")
            .expect("should acquire");
        assert!(second.was_reused());
    }

    #[tokio::test]
    async fn test_acquire_at_capacity_times_out() {
        let (pool, _connector, _accept) = pool_with_timeout(1, Duration::from_millis(30));
        let _held = pool.acquire().await.expect("should acquire");

        let err = pool.acquire().await.err().expect("no slot should free up");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_handshake_carries_signature() {
        let (pool, _connector, mut accept) = pool(1);
        let _conn = pool.acquire().await.expect("should acquire");
        let server = accept.recv().await.expect("server end");
        let timestamp: i64 = server
            .handshake
            .header("X-Api-Timestamp")
            .expect("timestamp header")
            .parse()
            .expect("numeric timestamp");
        let credentials = Credentials::new("app", "ak", "sk");
        assert_eq!(
            server.handshake.header("X-Api-Signature"),
            Some(credentials.sign(timestamp).as_str())
        );
    }
}
