//! Binary streaming protocol spoken to the speech service.

pub mod client;
pub mod frame;
pub mod pool;
pub mod session;
pub mod transport;

pub use client::{SessionConfig, SessionHandle, StreamingClient};
pub use frame::{Compression, Decoded, Flags, Frame, FrameBuffer, FrameError, MessageType};
pub use pool::{ConnectionPool, PooledConnection};
pub use session::{ProtocolSession, ResultPayload, ServerEvent, error_for_code};
pub use transport::{
    ChannelConnector, Connector, Credentials, FrameTransport, ServerEnd, WsConnector,
};
