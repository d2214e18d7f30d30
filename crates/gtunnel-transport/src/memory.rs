//! In-process transport
//!
//! Links two Tunnel instances living in the same process: a pair of control
//! streams backed by channels, and a hub that hands out the two ends of an
//! in-memory duplex pipe per connection.

use crate::{
    BoxedByteStream, ConnectionStreamHandler, StreamKey, TransportError, TransportResult,
    TunnelControlStream,
};
use async_trait::async_trait;
use gtunnel_proto::{ConnectionId, TunnelControlMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;

/// One end of an in-process control stream
pub struct MemoryControlStream {
    tx: mpsc::UnboundedSender<TunnelControlMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TunnelControlMessage>>,
}

/// Create two connected control stream ends
pub fn control_pair() -> (MemoryControlStream, MemoryControlStream) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();

    (
        MemoryControlStream {
            tx: left_tx,
            rx: tokio::sync::Mutex::new(left_rx),
        },
        MemoryControlStream {
            tx: right_tx,
            rx: tokio::sync::Mutex::new(right_rx),
        },
    )
}

#[async_trait]
impl TunnelControlStream for MemoryControlStream {
    async fn send(&self, message: &TunnelControlMessage) -> TransportResult<()> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn recv(&self) -> TransportResult<Option<TunnelControlMessage>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Pairs the two ends of an in-memory byte stream by `(tunnel_id, connection_id)`
///
/// The first caller for a key creates the pipe and parks the far end; the
/// second caller takes it. Neither side ever waits.
#[derive(Clone)]
pub struct MemoryStreamHub {
    pipes: Arc<Mutex<HashMap<StreamKey, DuplexStream>>>,
    capacity: usize,
}

impl MemoryStreamHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pipes: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn pipes(&self) -> MutexGuard<'_, HashMap<StreamKey, DuplexStream>> {
        self.pipes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get this side's end of the pipe for a connection
    pub fn pair(&self, tunnel_id: &str, connection_id: ConnectionId) -> DuplexStream {
        let key = (tunnel_id.to_string(), connection_id);
        let mut pipes = self.pipes();

        if let Some(far_end) = pipes.remove(&key) {
            trace!(tunnel_id, connection_id, "Joined parked pipe");
            return far_end;
        }

        let (near, far) = tokio::io::duplex(self.capacity);
        pipes.insert(key, far);
        trace!(tunnel_id, connection_id, "Parked new pipe");
        near
    }

    /// Number of pipes with one end still unclaimed
    pub fn pending(&self) -> usize {
        self.pipes().len()
    }

    /// Stream handler bound to one tunnel
    pub fn handler(&self, tunnel_id: impl Into<String>) -> MemoryStreamHandler {
        MemoryStreamHandler {
            hub: self.clone(),
            tunnel_id: tunnel_id.into(),
        }
    }
}

impl Default for MemoryStreamHub {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ConnectionStreamHandler`] backed by a [`MemoryStreamHub`]
pub struct MemoryStreamHandler {
    hub: MemoryStreamHub,
    tunnel_id: String,
}

#[async_trait]
impl ConnectionStreamHandler for MemoryStreamHandler {
    async fn get_byte_stream(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        Ok(Box::new(self.hub.pair(&self.tunnel_id, message.connection_id)))
    }

    async fn acknowledge(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        Ok(Box::new(self.hub.pair(&self.tunnel_id, message.connection_id)))
    }

    fn close_stream(&self, connection_id: ConnectionId) {
        let key = (self.tunnel_id.clone(), connection_id);
        self.hub.pipes().remove(&key);
    }
}
