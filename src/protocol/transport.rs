//! Duplex byte transports for the streaming protocol.
//!
//! [`Connector`] establishes a connection (performing the signed handshake)
//! and [`FrameTransport`] moves whole encoded frames over it. Production uses
//! WebSockets; tests use the in-memory [`ChannelConnector`].

use crate::error::{DubError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Speech service credentials.
#[derive(Clone)]
pub struct Credentials {
    pub app_id: String,
    pub access_key: SecretString,
    pub secret_key: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("access_key", &"[REDACTED]")
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn new(
        app_id: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            access_key: SecretString::from(access_key.into()),
            secret_key: SecretString::from(secret_key.into()),
        }
    }

    /// hex(SHA-256("app_id\ntimestamp\nsecret")).
    pub fn sign(&self, timestamp: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.app_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.secret_key.expose_secret().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Upgrade headers for a handshake at `timestamp` (Unix seconds).
    pub fn handshake(&self, timestamp: i64) -> Handshake {
        Handshake {
            headers: vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer;{}", self.access_key.expose_secret()),
                ),
                ("X-Api-App-Key".to_string(), self.app_id.clone()),
                (
                    "X-Api-Access-Key".to_string(),
                    self.access_key.expose_secret().to_string(),
                ),
                ("X-Api-Timestamp".to_string(), timestamp.to_string()),
                ("X-Api-Signature".to_string(), self.sign(timestamp)),
            ],
        }
    }
}

/// Headers sent with the connection upgrade.
#[derive(Clone, Default)]
pub struct Handshake {
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Handshake").field("headers", &names).finish()
    }
}

/// An established duplex connection carrying whole frames.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Next inbound message; `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    async fn close(&mut self) -> Result<()>;

    /// False after any I/O failure or peer close.
    fn is_healthy(&self) -> bool;
}

/// Establishes new connections to a protocol endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, handshake: &Handshake) -> Result<Box<dyn FrameTransport>>;
}

/// WebSocket connector over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, handshake: &Handshake) -> Result<Box<dyn FrameTransport>> {
        let mut request = url
            .into_client_request()
            .map_err(|e| DubError::protocol(format!("invalid endpoint {}: {}", url, e)))?;

        for (name, value) in &handshake.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DubError::protocol(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DubError::protocol(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_ws_error)?;
        tracing::debug!(url, "speech connection established");
        Ok(Box::new(WsTransport {
            ws,
            healthy: true,
        }))
    }
}

fn map_ws_error(err: tokio_tungstenite::tungstenite::Error) -> DubError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                DubError::Auth {
                    message: format!("handshake rejected with HTTP {}", status.as_u16()),
                }
            } else if status == StatusCode::TOO_MANY_REQUESTS {
                DubError::Quota {
                    message: format!("handshake rejected with HTTP {}", status.as_u16()),
                }
            } else {
                DubError::Network {
                    message: format!("handshake failed with HTTP {}", status.as_u16()),
                }
            }
        }
        other => DubError::Network {
            message: other.to_string(),
        },
    }
}

struct WsTransport {
    ws: WsStream,
    healthy: bool,
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        if let Err(e) = self.ws.send(Message::Binary(bytes.into())).await {
            self.healthy = false;
            return Err(map_ws_error(e));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => {
                    self.healthy = false;
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.healthy = false;
                    return Err(map_ws_error(e));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.healthy = false;
        self.ws.close(None).await.map_err(map_ws_error)
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Server side of an in-memory connection.
pub struct ServerEnd {
    pub handshake: Handshake,
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// In-memory connector: every `connect` hands a [`ServerEnd`] to whoever
/// holds the accept receiver.
#[derive(Clone)]
pub struct ChannelConnector {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    reject_status: Arc<Mutex<Option<u16>>>,
    connects: Arc<AtomicUsize>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                reject_status: Arc::new(Mutex::new(None)),
                connects: Arc::new(AtomicUsize::new(0)),
            },
            accept_rx,
        )
    }

    /// Fail subsequent handshakes as if the server answered with `status`.
    pub async fn reject_with(&self, status: u16) {
        *self.reject_status.lock().await = Some(status);
    }

    /// Number of successful connections established so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _url: &str, handshake: &Handshake) -> Result<Box<dyn FrameTransport>> {
        if let Some(status) = *self.reject_status.lock().await {
            return Err(match status {
                401 | 403 => DubError::Auth {
                    message: format!("handshake rejected with HTTP {}", status),
                },
                _ => DubError::Network {
                    message: format!("handshake failed with HTTP {}", status),
                },
            });
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(ServerEnd {
                handshake: handshake.clone(),
                to_client: server_tx,
                from_client: server_rx,
            })
            .map_err(|_| DubError::Network {
                message: "connection refused".to_string(),
            })?;
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ChannelTransport {
            tx: Some(client_tx),
            rx: client_rx,
            healthy: true,
        }))
    }
}

struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    healthy: bool,
}

#[async_trait]
impl FrameTransport for ChannelTransport {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        let sent = self.tx.as_ref().is_some_and(|tx| tx.send(bytes).is_ok());
        if !sent {
            self.healthy = false;
            return Err(DubError::Network {
                message: "connection closed by peer".to_string(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let message = self.rx.recv().await;
        if message.is_none() {
            self.healthy = false;
        }
        Ok(message)
    }

    async fn close(&mut self) -> Result<()> {
        self.healthy = false;
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.tx.is_some()
    }
}
