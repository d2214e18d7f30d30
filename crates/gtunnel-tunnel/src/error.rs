use gtunnel_proto::ConnectionId;
use gtunnel_transport::TransportError;
use thiserror::Error;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("Control stream already bound for tunnel {0}")]
    ControlStreamAlreadyBound(String),

    #[error("No control stream bound for tunnel {0}")]
    ControlStreamNotBound(String),

    #[error("Tunnel {0} already started")]
    AlreadyStarted(String),

    #[error("Tunnel {0} is stopped")]
    Stopped(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Connection table error: {0}")]
    Table(#[from] TableError),
}

/// Errors raised by a single [`Connection`](crate::Connection)
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection {0} has no byte stream attached")]
    NoStream(ConnectionId),

    #[error("Connection {0} already started")]
    AlreadyStarted(ConnectionId),

    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Errors raised by the [`ConnectionTable`](crate::ConnectionTable)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("Connection table is closed")]
    Closed,

    #[error("No connection ids left")]
    IdsExhausted,
}
