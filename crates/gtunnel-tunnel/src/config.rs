//! Tunnel configuration

use gtunnel_proto::Direction;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Static description of one tunnel, shared by both endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelConfig {
    /// Correlates the two Tunnel instances of this tunnel
    pub id: String,

    /// Which side listens locally
    #[serde(default)]
    pub direction: Direction,

    /// Where the listening side accepts client connections
    pub listen: SocketAddr,

    /// Where the other side dials for every announced connection
    pub destination: SocketAddr,

    /// Endpoint id stamped on `Connect` messages from this side
    #[serde(default)]
    pub endpoint_id: String,

    /// Upper bound on dialing the destination; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_timeout_ms: Option<u64>,
}

impl TunnelConfig {
    pub fn new(
        id: impl Into<String>,
        direction: Direction,
        listen: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            listen,
            destination,
            endpoint_id: String::new(),
            dial_timeout_ms: None,
        }
    }

    pub fn with_endpoint_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = endpoint_id.into();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout_ms.map(Duration::from_millis)
    }
}
