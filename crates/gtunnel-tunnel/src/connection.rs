//! One tunneled TCP connection

use crate::error::ConnectionError;
use gtunnel_proto::ConnectionId;
use gtunnel_transport::BoxedByteStream;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lifecycle of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket held, no byte stream yet
    Pending,
    /// Byte stream attached, copy not running
    Attached,
    /// Copying between socket and byte stream
    Started,
    Closed,
}

/// Which side of the handshake created a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// Accepted on a local listener and announced with `Connect`
    Accepted,
    /// Dialed towards the destination on a peer's `Connect`
    Dialed,
}

/// Point-in-time view of a [`Connection`]
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub endpoint_id: String,
    pub peer_addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub origin: ConnectionOrigin,
    pub created_at: Instant,
}

/// How a started connection's copy loop ended
#[derive(Debug)]
pub(crate) enum ServiceOutcome {
    /// Both directions reached EOF
    Finished,
    Failed(std::io::Error),
    /// Stopped through [`Connection::close`]
    Cancelled,
}

/// A local TCP socket paired with the byte stream that carries it across the tunnel
pub struct Connection {
    id: ConnectionId,
    endpoint_id: String,
    socket: Option<TcpStream>,
    stream: Option<BoxedByteStream>,
    peer_addr: Option<SocketAddr>,
    state: ConnectionState,
    origin: ConnectionOrigin,
    cancel: CancellationToken,
    created_at: Instant,
}

impl Connection {
    pub fn new(socket: TcpStream) -> Self {
        let peer_addr = socket.peer_addr().ok();
        Self {
            id: 0,
            endpoint_id: String::new(),
            socket: Some(socket),
            stream: None,
            peer_addr,
            state: ConnectionState::Pending,
            origin: ConnectionOrigin::Accepted,
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    pub fn with_endpoint_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = endpoint_id.into();
        self
    }

    pub fn with_origin(mut self, origin: ConnectionOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Tie the copy loop to an outer cancellation token
    pub(crate) fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: ConnectionId) {
        self.id = id;
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            endpoint_id: self.endpoint_id.clone(),
            peer_addr: self.peer_addr,
            state: self.state,
            origin: self.origin,
            created_at: self.created_at,
        }
    }

    /// Attach the data-plane byte stream
    ///
    /// A stream attached earlier but not yet started is replaced.
    pub fn set_stream(&mut self, stream: BoxedByteStream) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Closed => Err(ConnectionError::Closed(self.id)),
            ConnectionState::Started => Err(ConnectionError::AlreadyStarted(self.id)),
            ConnectionState::Pending | ConnectionState::Attached => {
                self.stream = Some(stream);
                self.state = ConnectionState::Attached;
                Ok(())
            }
        }
    }

    /// Spawn the bidirectional copy between the socket and the byte stream
    pub(crate) fn start(&mut self) -> Result<JoinHandle<ServiceOutcome>, ConnectionError> {
        match self.state {
            ConnectionState::Closed => return Err(ConnectionError::Closed(self.id)),
            ConnectionState::Started => return Err(ConnectionError::AlreadyStarted(self.id)),
            ConnectionState::Pending => return Err(ConnectionError::NoStream(self.id)),
            ConnectionState::Attached => {}
        }

        let (mut socket, mut stream) = match (self.socket.take(), self.stream.take()) {
            (Some(socket), Some(stream)) => (socket, stream),
            _ => return Err(ConnectionError::NoStream(self.id)),
        };
        self.state = ConnectionState::Started;

        let id = self.id;
        let cancel = self.cancel.clone();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(connection_id = id, "Connection service cancelled");
                    ServiceOutcome::Cancelled
                }
                result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => match result {
                    Ok((to_tunnel, to_socket)) => {
                        info!(
                            connection_id = id,
                            bytes_to_tunnel = to_tunnel,
                            bytes_to_socket = to_socket,
                            "Connection finished"
                        );
                        ServiceOutcome::Finished
                    }
                    Err(e) => {
                        debug!(connection_id = id, error = %e, "Connection copy failed");
                        ServiceOutcome::Failed(e)
                    }
                },
            }
        }))
    }

    /// Close the socket and stop the copy loop
    ///
    /// Returns false if the connection was already closed.
    pub fn close(&mut self) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }

        self.cancel.cancel();
        self.socket.take();
        self.stream.take();
        self.state = ConnectionState::Closed;
        debug!(connection_id = self.id, "Connection closed");
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
