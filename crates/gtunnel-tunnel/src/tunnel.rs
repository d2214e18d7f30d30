//! Tunnel orchestration: listeners, connection table and the control state machine

use crate::config::TunnelConfig;
use crate::connection::{Connection, ConnectionInfo, ConnectionOrigin, ServiceOutcome};
use crate::error::{ConnectionError, TableError, TunnelError};
use crate::registry::ConnectionTable;
use gtunnel_proto::{error_status, ConnectionId, Direction, Operation, TunnelControlMessage};
use gtunnel_transport::{BoxedByteStream, ConnectionStreamHandler, TunnelControlStream};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion) cannot spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What a call to [`Tunnel::stop`] actually tore down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub listeners_closed: usize,
    pub connections_closed: usize,
}

struct ListenerHandle {
    local_addr: SocketAddr,
    endpoint_id: String,
    token: CancellationToken,
}

/// One endpoint of a logical tunnel
///
/// A Tunnel is always handled through an `Arc`: its listeners, dispatch loop
/// and per-connection tasks keep a reference for as long as they run.
///
/// Typical lifecycle:
///
/// 1. [`Tunnel::new`] with the shared [`TunnelConfig`] and a stream handler
/// 2. [`set_control_stream`](Tunnel::set_control_stream) exactly once
/// 3. [`add_listener`](Tunnel::add_listener) on the listening side
/// 4. [`start`](Tunnel::start)
/// 5. [`stop`](Tunnel::stop), then [`wait`](Tunnel::wait)
pub struct Tunnel {
    config: TunnelConfig,
    connections: ConnectionTable,
    listeners: Mutex<Vec<ListenerHandle>>,
    ctrl_stream: OnceLock<Arc<dyn TunnelControlStream>>,
    handler: Arc<dyn ConnectionStreamHandler>,
    shutdown: CancellationToken,
    ingress_done: CancellationToken,
    started: AtomicBool,
    tasks: TaskTracker,
    finished_tx: mpsc::UnboundedSender<ConnectionId>,
    finished_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionId>>>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig, handler: Arc<dyn ConnectionStreamHandler>) -> Arc<Self> {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            connections: ConnectionTable::new(),
            listeners: Mutex::new(Vec::new()),
            ctrl_stream: OnceLock::new(),
            handler,
            shutdown: CancellationToken::new(),
            ingress_done: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            finished_tx,
            finished_rx: Mutex::new(Some(finished_rx)),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen
    }

    pub fn destination(&self) -> SocketAddr {
        self.config.destination
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Addresses of the listeners that are still open
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.listeners().iter().map(|l| l.local_addr).collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<ListenerHandle>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the control stream shared with the peer Tunnel
    pub fn set_control_stream(
        &self,
        stream: Arc<dyn TunnelControlStream>,
    ) -> Result<(), TunnelError> {
        self.ctrl_stream
            .set(stream)
            .map_err(|_| TunnelError::ControlStreamAlreadyBound(self.id().to_string()))
    }

    pub fn control_stream(&self) -> Result<Arc<dyn TunnelControlStream>, TunnelError> {
        self.ctrl_stream
            .get()
            .cloned()
            .ok_or_else(|| TunnelError::ControlStreamNotBound(self.id().to_string()))
    }

    async fn send(&self, message: &TunnelControlMessage) -> Result<(), TunnelError> {
        self.control_stream()?.send(message).await?;
        Ok(())
    }

    /// Launch the control-message dispatch loop
    pub fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.is_stopped() {
            return Err(TunnelError::Stopped(self.id().to_string()));
        }
        let control = self.control_stream()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::AlreadyStarted(self.id().to_string()));
        }

        let finished = self
            .finished_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(finished) = finished {
            self.tasks.spawn(self.clone().run_reaper(finished));
        }
        self.tasks.spawn(self.clone().run_ingress(control));

        info!(
            tunnel_id = %self.id(),
            direction = self.direction().as_str(),
            destination = %self.destination(),
            "Tunnel started"
        );
        Ok(())
    }

    /// Close every listener and connection, then fire the shutdown signal
    ///
    /// Safe to call any number of times; only the first call finds anything
    /// to close.
    pub async fn stop(&self) -> ShutdownReport {
        let listeners: Vec<ListenerHandle> = self.listeners().drain(..).collect();
        for listener in &listeners {
            listener.token.cancel();
            debug!(
                tunnel_id = %self.id(),
                addr = %listener.local_addr,
                endpoint_id = %listener.endpoint_id,
                "Listener closed"
            );
        }

        let mut connections_closed = 0;
        for mut connection in self.connections.close_and_drain().await {
            if connection.close() {
                connections_closed += 1;
            }
            self.handler.close_stream(connection.id());
        }

        let first = !self.shutdown.is_cancelled();
        self.shutdown.cancel();
        self.tasks.close();

        let report = ShutdownReport {
            listeners_closed: listeners.len(),
            connections_closed,
        };
        if first {
            info!(
                tunnel_id = %self.id(),
                listeners = report.listeners_closed,
                connections = report.connections_closed,
                "Tunnel stopped"
            );
        }
        report
    }

    /// Resolves once every task of this tunnel has finished
    ///
    /// Only completes after [`stop`](Self::stop).
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }

    /// Resolves once the dispatch loop has ended
    ///
    /// That happens when the control stream dies or the tunnel is stopped.
    /// Never resolves if the tunnel was never started.
    pub async fn ingress_closed(&self) {
        self.ingress_done.cancelled().await;
    }

    /// Bind a listener on the wildcard address; port 0 picks an ephemeral port
    ///
    /// Every accepted socket becomes a connection announced to the peer with a
    /// `Connect` carrying `endpoint_id`.
    pub async fn add_listener(
        self: &Arc<Self>,
        port: u16,
        endpoint_id: impl Into<String>,
    ) -> Result<SocketAddr, TunnelError> {
        if self.is_stopped() {
            return Err(TunnelError::Stopped(self.id().to_string()));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| TunnelError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { port, source })?;

        let endpoint_id = endpoint_id.into();
        let token = self.shutdown.child_token();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        self.tasks.spawn(Self::run_accept(
            self.id().to_string(),
            listener,
            token.clone(),
            accepted_tx,
        ));
        self.tasks
            .spawn(self.clone().run_announce(accepted_rx, endpoint_id.clone()));

        info!(
            tunnel_id = %self.id(),
            addr = %local_addr,
            endpoint_id = %endpoint_id,
            "Listening for tunnel connections"
        );

        self.listeners().push(ListenerHandle {
            local_addr,
            endpoint_id,
            token,
        });
        Ok(local_addr)
    }

    /// Register a connection under a fresh id
    pub async fn add_connection(
        &self,
        connection: Connection,
    ) -> Result<ConnectionId, TunnelError> {
        let connection = connection.with_parent_token(&self.shutdown);
        Ok(self.connections.add(connection).await?)
    }

    pub async fn get_connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).await
    }

    /// Remove, close and release the transport state of a connection
    ///
    /// Returns false if no connection had that id.
    pub async fn remove_connection(&self, id: ConnectionId) -> bool {
        match self.connections.remove(id).await {
            Some(mut connection) => {
                connection.close();
                self.handler.close_stream(id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the connection table
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.snapshot().await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.len().await
    }

    async fn run_accept(
        tunnel_id: String,
        listener: TcpListener,
        token: CancellationToken,
        accepted: mpsc::UnboundedSender<TcpStream>,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((socket, peer_addr)) => {
                        debug!(tunnel_id = %tunnel_id, peer = %peer_addr, "Accepted connection");
                        if accepted.send(socket).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection for tunnel {}: {}", tunnel_id, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
        debug!(tunnel_id = %tunnel_id, "Accept loop ended");
    }

    async fn run_announce(
        self: Arc<Self>,
        mut accepted: mpsc::UnboundedReceiver<TcpStream>,
        endpoint_id: String,
    ) {
        while let Some(socket) = accepted.recv().await {
            self.announce(socket, &endpoint_id).await;
        }
    }

    /// Register an accepted socket and tell the peer about it
    async fn announce(&self, socket: TcpStream, endpoint_id: &str) {
        let connection = Connection::new(socket).with_endpoint_id(endpoint_id);
        let id = match self.add_connection(connection).await {
            Ok(id) => id,
            Err(e) => {
                debug!(tunnel_id = %self.id(), error = %e, "Dropping accepted connection");
                return;
            }
        };

        let connect = TunnelControlMessage::connect(self.id(), id, endpoint_id);
        if let Err(e) = self.send(&connect).await {
            warn!(
                tunnel_id = %self.id(),
                connection_id = id,
                error = %e,
                "Failed to send Connect"
            );
            self.remove_connection(id).await;
            return;
        }
        debug!(tunnel_id = %self.id(), connection_id = id, "Sent Connect");
    }

    async fn run_ingress(self: Arc<Self>, control: Arc<dyn TunnelControlStream>) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(tunnel_id = %self.id(), "Dispatch loop stopped by shutdown");
                    break;
                }
                received = control.recv() => match received {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        info!(tunnel_id = %self.id(), "Control stream closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!(tunnel_id = %self.id(), error = %e, "Control stream failed");
                        break;
                    }
                },
            };
            self.dispatch(message).await;
        }
        self.ingress_done.cancel();
    }

    async fn dispatch(self: &Arc<Self>, message: TunnelControlMessage) {
        if message.tunnel_id != self.id() {
            warn!(
                tunnel_id = %self.id(),
                received_tunnel_id = %message.tunnel_id,
                operation = %message.operation,
                "Ignoring control message for another tunnel"
            );
            return;
        }

        match message.operation {
            Operation::Connect => {
                self.tasks.spawn(self.clone().handle_connect(message));
            }
            Operation::Ack => {
                self.tasks.spawn(self.clone().handle_ack(message));
            }
            Operation::Disconnect => self.handle_disconnect(message).await,
            Operation::Unknown(code) => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = message.connection_id,
                    code,
                    "Ignoring unknown control operation"
                );
            }
        }
    }

    async fn dial_destination(&self) -> std::io::Result<TcpStream> {
        let dial = TcpStream::connect(self.config.destination);
        match self.config.dial_timeout() {
            Some(limit) => tokio::time::timeout(limit, dial).await.unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial timed out after {:?}", limit),
                ))
            }),
            None => dial.await,
        }
    }

    /// Responder side: dial, register, acknowledge, then open the byte stream
    ///
    /// The `Ack` goes out before the byte stream is requested so a handler
    /// that waits for the initiator's stream can be satisfied.
    async fn handle_connect(self: Arc<Self>, message: TunnelControlMessage) {
        let id = message.connection_id;

        let Some(dialed) = self.until_shutdown(self.dial_destination()).await else {
            return;
        };
        let socket = match dialed {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    destination = %self.destination(),
                    error = %e,
                    "Failed to dial destination"
                );
                let nack = message
                    .reply(Operation::Ack)
                    .with_status(error_status::DIAL_FAILED);
                self.send_quietly(&nack).await;
                return;
            }
        };

        let connection = Connection::new(socket)
            .with_endpoint_id(message.endpoint_id.clone())
            .with_origin(ConnectionOrigin::Dialed)
            .with_parent_token(&self.shutdown);
        match self.connections.insert_if_absent(id, connection).await {
            Ok(true) => {}
            Ok(false) => {
                self.reject_duplicate(&message).await;
                return;
            }
            Err(TableError::Closed) => {
                debug!(tunnel_id = %self.id(), connection_id = id, "Connect during shutdown");
                return;
            }
            Err(e) => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    error = %e,
                    "Cannot register connection"
                );
                return;
            }
        }

        if let Err(e) = self.send(&message.reply(Operation::Ack)).await {
            warn!(tunnel_id = %self.id(), connection_id = id, error = %e, "Failed to send Ack");
            self.remove_connection(id).await;
            return;
        }

        let Some(opened) = self
            .until_shutdown(self.handler.get_byte_stream(&message))
            .await
        else {
            return;
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    error = %e,
                    "No byte stream for connection"
                );
                self.abort(&message).await;
                return;
            }
        };
        if let Err(e) = self.attach_and_start(id, stream).await {
            warn!(
                tunnel_id = %self.id(),
                connection_id = id,
                error = %e,
                "Failed to start connection"
            );
            self.abort(&message).await;
        }
    }

    /// A `Connect` for an id that already has a record
    ///
    /// A record dialed for an earlier `Connect` stays with the setup already
    /// running for it and the fresh dial is dropped. An id held by one of our
    /// accepted connections cannot be served, so the peer gets a nack.
    async fn reject_duplicate(&self, message: &TunnelControlMessage) {
        let id = message.connection_id;
        let Some(existing) = self.connections.get(id).await else {
            return;
        };

        match existing.origin {
            ConnectionOrigin::Dialed => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    state = ?existing.state,
                    "Duplicate Connect, dropping the extra destination dial"
                );
            }
            ConnectionOrigin::Accepted => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    "Connect for an id held by a local connection"
                );
                let nack = message
                    .reply(Operation::Ack)
                    .with_status(error_status::ID_IN_USE);
                self.send_quietly(&nack).await;
            }
        }
    }

    /// Initiator side: the peer answered our `Connect`
    async fn handle_ack(self: Arc<Self>, message: TunnelControlMessage) {
        let id = message.connection_id;

        if !message.is_success() {
            if self.remove_connection(id).await {
                info!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    status = message.error_status,
                    "Peer rejected connection"
                );
            } else {
                debug!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    "Rejection for unknown connection"
                );
            }
            return;
        }

        if !self.connections.contains(id).await {
            warn!(tunnel_id = %self.id(), connection_id = id, "Ack for unknown connection");
            let reply = message
                .reply(Operation::Disconnect)
                .with_status(error_status::UNKNOWN_CONNECTION);
            self.send_quietly(&reply).await;
            return;
        }

        let Some(opened) = self
            .until_shutdown(self.handler.acknowledge(&message))
            .await
        else {
            return;
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    tunnel_id = %self.id(),
                    connection_id = id,
                    error = %e,
                    "No byte stream for connection"
                );
                self.abort(&message).await;
                return;
            }
        };
        if let Err(e) = self.attach_and_start(id, stream).await {
            warn!(
                tunnel_id = %self.id(),
                connection_id = id,
                error = %e,
                "Failed to start connection"
            );
            self.abort(&message).await;
        }
    }

    async fn handle_disconnect(&self, message: TunnelControlMessage) {
        let id = message.connection_id;
        if self.remove_connection(id).await {
            debug!(
                tunnel_id = %self.id(),
                connection_id = id,
                status = message.error_status,
                "Connection closed by peer"
            );
        } else {
            debug!(tunnel_id = %self.id(), connection_id = id, "Disconnect for unknown connection");
        }
    }

    /// Drop a connection whose byte stream failed and tell the peer
    async fn abort(&self, message: &TunnelControlMessage) {
        if self.remove_connection(message.connection_id).await {
            let reply = message
                .reply(Operation::Disconnect)
                .with_status(error_status::STREAM_FAILED);
            self.send_quietly(&reply).await;
        }
    }

    /// Run `fut` unless the tunnel stops first
    async fn until_shutdown<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            output = fut => Some(output),
        }
    }

    async fn send_quietly(&self, message: &TunnelControlMessage) {
        if let Err(e) = self.send(message).await {
            debug!(
                tunnel_id = %self.id(),
                connection_id = message.connection_id,
                operation = %message.operation,
                error = %e,
                "Failed to send control message"
            );
        }
    }

    async fn attach_and_start(
        &self,
        id: ConnectionId,
        stream: BoxedByteStream,
    ) -> Result<(), TunnelError> {
        let service = self
            .connections
            .with_connection(
                id,
                move |connection: &mut Connection| -> Result<_, ConnectionError> {
                    connection.set_stream(stream)?;
                    connection.start()
                },
            )
            .await
            .ok_or(ConnectionError::Closed(id))??;

        self.tasks.spawn(Self::watch(
            self.id().to_string(),
            id,
            service,
            self.finished_tx.clone(),
        ));
        debug!(tunnel_id = %self.id(), connection_id = id, "Connection started");
        Ok(())
    }

    /// Report a connection whose copy loop ended on its own
    async fn watch(
        tunnel_id: String,
        id: ConnectionId,
        service: JoinHandle<ServiceOutcome>,
        finished: mpsc::UnboundedSender<ConnectionId>,
    ) {
        match service.await {
            Ok(ServiceOutcome::Cancelled) => return,
            Ok(ServiceOutcome::Finished) => {}
            Ok(ServiceOutcome::Failed(e)) => {
                debug!(tunnel_id = %tunnel_id, connection_id = id, error = %e, "Connection failed");
            }
            Err(e) => {
                error!(
                    tunnel_id = %tunnel_id,
                    connection_id = id,
                    error = %e,
                    "Connection task panicked"
                );
            }
        }
        let _ = finished.send(id);
    }

    async fn run_reaper(self: Arc<Self>, mut finished: mpsc::UnboundedReceiver<ConnectionId>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = finished.recv() => match next {
                    Some(id) => self.reap(id).await,
                    None => break,
                },
            }
        }
    }

    async fn reap(&self, id: ConnectionId) {
        let endpoint_id = match self.connections.get(id).await {
            Some(info) => info.endpoint_id,
            None => return,
        };
        if self.remove_connection(id).await {
            debug!(tunnel_id = %self.id(), connection_id = id, "Connection ended locally");
            let disconnect = TunnelControlMessage::disconnect(self.id(), id, endpoint_id);
            self.send_quietly(&disconnect).await;
        }
    }
}
