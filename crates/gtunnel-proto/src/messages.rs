//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel-scoped connection identifier
pub type ConnectionId = i32;

/// Status codes carried in [`TunnelControlMessage::error_status`]
pub mod error_status {
    /// Operation succeeded
    pub const OK: i32 = 0;
    /// The responder could not dial the tunnel destination
    pub const DIAL_FAILED: i32 = 1;
    /// The data-plane byte stream could not be established
    pub const STREAM_FAILED: i32 = 2;
    /// The referenced connection id is not known to the sender
    pub const UNKNOWN_CONNECTION: i32 = 3;
    /// The connection id is already held by one of the receiver's own connections
    pub const ID_IN_USE: i32 = 4;
}

/// Control operation
///
/// Encoded as a bare `u32` so that a peer speaking a newer protocol revision
/// can still be decoded; values we do not know land in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Operation {
    Connect,
    Ack,
    Disconnect,
    Unknown(u32),
}

impl From<u32> for Operation {
    fn from(value: u32) -> Self {
        match value {
            0 => Operation::Connect,
            1 => Operation::Ack,
            2 => Operation::Disconnect,
            other => Operation::Unknown(other),
        }
    }
}

impl From<Operation> for u32 {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Connect => 0,
            Operation::Ack => 1,
            Operation::Disconnect => 2,
            Operation::Unknown(other) => other,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Connect => write!(f, "connect"),
            Operation::Ack => write!(f, "ack"),
            Operation::Disconnect => write!(f, "disconnect"),
            Operation::Unknown(code) => write!(f, "unknown({})", code),
        }
    }
}

/// Which side of a tunnel listens locally
///
/// - `Forward`: the agent listens, the relay dials the destination
/// - `Reverse`: the relay listens, the agent dials the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reverse => "reverse",
        }
    }
}

/// Control message exchanged between the two Tunnel instances of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelControlMessage {
    pub operation: Operation,
    pub tunnel_id: String,
    pub connection_id: ConnectionId,
    /// Routes the message when several agents share one tunnel id
    pub endpoint_id: String,
    pub error_status: i32,
}

impl TunnelControlMessage {
    pub fn new(
        operation: Operation,
        tunnel_id: impl Into<String>,
        connection_id: ConnectionId,
        endpoint_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            tunnel_id: tunnel_id.into(),
            connection_id,
            endpoint_id: endpoint_id.into(),
            error_status: error_status::OK,
        }
    }

    pub fn connect(
        tunnel_id: impl Into<String>,
        connection_id: ConnectionId,
        endpoint_id: impl Into<String>,
    ) -> Self {
        Self::new(Operation::Connect, tunnel_id, connection_id, endpoint_id)
    }

    pub fn ack(
        tunnel_id: impl Into<String>,
        connection_id: ConnectionId,
        endpoint_id: impl Into<String>,
    ) -> Self {
        Self::new(Operation::Ack, tunnel_id, connection_id, endpoint_id)
    }

    /// An `Ack` carrying a failure status
    pub fn nack(
        tunnel_id: impl Into<String>,
        connection_id: ConnectionId,
        endpoint_id: impl Into<String>,
        status: i32,
    ) -> Self {
        Self::ack(tunnel_id, connection_id, endpoint_id).with_status(status)
    }

    pub fn disconnect(
        tunnel_id: impl Into<String>,
        connection_id: ConnectionId,
        endpoint_id: impl Into<String>,
    ) -> Self {
        Self::new(Operation::Disconnect, tunnel_id, connection_id, endpoint_id)
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.error_status = status;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error_status == error_status::OK
    }

    /// Build the reply to this message, keeping its routing fields
    pub fn reply(&self, operation: Operation) -> Self {
        Self::new(
            operation,
            self.tunnel_id.clone(),
            self.connection_id,
            self.endpoint_id.clone(),
        )
    }
}

/// Which handshake phase opened a data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamRole {
    /// Opened by the side that received `Connect`
    Responder,
    /// Opened by the side that received a successful `Ack`
    Initiator,
}

/// First frame written on every TCP stream opened towards a relay
///
/// Lets the relay serve control and data streams on a single port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamHeader {
    Control {
        tunnel_id: String,
    },
    Data {
        tunnel_id: String,
        connection_id: ConnectionId,
        role: StreamRole,
    },
}

impl StreamHeader {
    pub fn tunnel_id(&self) -> &str {
        match self {
            StreamHeader::Control { tunnel_id } => tunnel_id,
            StreamHeader::Data { tunnel_id, .. } => tunnel_id,
        }
    }
}
