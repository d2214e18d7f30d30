//! Transport abstraction layer for gTunnel
//!
//! The tunnel core never touches sockets for its control channel or its data
//! plane directly. It talks to two capabilities defined here:
//!
//! - [`TunnelControlStream`]: the ordered, reliable channel carrying
//!   `Connect`/`Ack`/`Disconnect` messages between the two Tunnel instances
//! - [`ConnectionStreamHandler`]: produces the byte stream that carries the
//!   payload of one tunneled connection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Tunnel (gtunnel-tunnel)                │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            gtunnel-transport (this crate)               │
//! │  - TunnelControlStream  - ConnectionStreamHandler       │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────┬──────────────────┬───────────────────┐
//! │ FramedControl-   │ DialStreamHandler│ memory            │
//! │ Stream (any I/O) │ AcceptStream-    │ (in-process)      │
//! │                  │ Handler (TCP)    │                   │
//! └──────────────────┴──────────────────┴───────────────────┘
//! ```

use async_trait::async_trait;
use gtunnel_proto::{CodecError, ConnectionId, TunnelControlMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod framed;
pub mod memory;
pub mod rendezvous;
pub mod tcp;

pub use framed::FramedControlStream;
pub use memory::{control_pair, MemoryControlStream, MemoryStreamHandler, MemoryStreamHub};
pub use rendezvous::{Rendezvous, StreamKey};
pub use tcp::{
    read_header, write_header, AcceptStreamHandler, DataStreamRendezvous, DialStreamHandler,
};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Byte stream for connection {0} was abandoned")]
    Abandoned(ConnectionId),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Data-plane byte stream carrying the payload of one tunneled connection
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Owned, type-erased byte stream
pub type BoxedByteStream = Box<dyn ByteStream>;

/// Ordered, reliable, bidirectional channel of control messages
///
/// One control stream links the two Tunnel instances of a logical tunnel.
/// `recv` returning `Ok(None)` or an error means the stream is dead; callers
/// must not expect further messages.
#[async_trait]
pub trait TunnelControlStream: Send + Sync {
    /// Send a control message to the peer
    async fn send(&self, message: &TunnelControlMessage) -> TransportResult<()>;

    /// Receive the next control message from the peer
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv(&self) -> TransportResult<Option<TunnelControlMessage>>;
}

/// Creates the data-plane byte stream for a tunneled connection
///
/// The two establishment phases stay separate methods because they run at
/// different points of the handshake:
///
/// - `get_byte_stream` runs on the side that received `Connect` and already
///   dialed the destination
/// - `acknowledge` runs on the side that accepted the client socket, once the
///   peer confirmed with a successful `Ack`
#[async_trait]
pub trait ConnectionStreamHandler: Send + Sync {
    /// Responder side: open the byte stream for a connection announced by `Connect`
    async fn get_byte_stream(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream>;

    /// Initiator side: open the byte stream once the peer acknowledged the connection
    async fn acknowledge(&self, message: &TunnelControlMessage)
        -> TransportResult<BoxedByteStream>;

    /// Release any transport state held for a connection
    fn close_stream(&self, connection_id: ConnectionId);
}
