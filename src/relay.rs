//! Relay side: one public port serving control and data streams
//!
//! Each accepted TCP stream opens with a [`StreamHeader`]. A control header
//! starts (or replaces) the relay's Tunnel for that tunnel id; a data header
//! parks the stream until the Tunnel claims it for a connection.

use anyhow::{Context, Result};
use gtunnel_proto::StreamHeader;
use gtunnel_transport::{
    read_header, AcceptStreamHandler, DataStreamRendezvous, FramedControlStream,
};
use gtunnel_tunnel::{Direction, Tunnel, TunnelConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A peer that connects but never sends its header is dropped after this long
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Relay {
    tunnels: HashMap<String, TunnelConfig>,
    rendezvous: Arc<DataStreamRendezvous>,
    active: Mutex<HashMap<String, Arc<Tunnel>>>,
    claim_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(tunnels: Vec<TunnelConfig>) -> Self {
        Self {
            tunnels: tunnels.into_iter().map(|t| (t.id.clone(), t)).collect(),
            rendezvous: Arc::new(DataStreamRendezvous::new()),
            active: Mutex::new(HashMap::new()),
            claim_timeout: None,
        }
    }

    /// Override how long a Tunnel waits for the agent's data stream
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = Some(timeout);
        self.rendezvous = Arc::new(DataStreamRendezvous::new().with_ttl(timeout));
        self
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<Tunnel>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The running Tunnel for `tunnel_id`, if an agent is attached
    pub fn tunnel(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.active().get(tunnel_id).cloned()
    }

    /// Accept streams until `shutdown` fires, then stop every Tunnel
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        let tasks = TaskTracker::new();

        match listener.local_addr() {
            Ok(addr) => info!("Relay listening on {}", addr),
            Err(e) => warn!("Relay listening on unknown address: {}", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let relay = self.clone();
                        let shutdown = shutdown.clone();
                        tasks.spawn(async move {
                            if let Err(e) = relay.handle_stream(socket, peer_addr, shutdown).await {
                                warn!("Stream from {} rejected: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept relay connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(listener);
        tasks.close();
        tasks.wait().await;
        info!("Relay stopped");
    }

    async fn handle_stream(
        self: Arc<Self>,
        mut socket: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let header = tokio::time::timeout(HEADER_TIMEOUT, read_header(&mut socket))
            .await
            .context("Timed out waiting for stream header")?
            .context("Failed to read stream header")?;

        match header {
            StreamHeader::Control { tunnel_id } => {
                self.serve_control(tunnel_id, socket, peer_addr, shutdown)
                    .await
            }
            StreamHeader::Data {
                tunnel_id,
                connection_id,
                role,
            } => {
                if !self.tunnels.contains_key(&tunnel_id) {
                    anyhow::bail!("Data stream for unknown tunnel {}", tunnel_id);
                }
                socket.set_nodelay(true)?;
                debug!(
                    tunnel_id = %tunnel_id,
                    connection_id,
                    role = ?role,
                    "Data stream arrived"
                );
                self.rendezvous
                    .offer((tunnel_id, connection_id), Box::new(socket));
                Ok(())
            }
        }
    }

    /// Run the relay's Tunnel for one agent control connection
    async fn serve_control(
        &self,
        tunnel_id: String,
        socket: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let config = self
            .tunnels
            .get(&tunnel_id)
            .cloned()
            .with_context(|| format!("Unknown tunnel {}", tunnel_id))?;
        socket.set_nodelay(true)?;

        let mut handler = AcceptStreamHandler::new(tunnel_id.clone(), self.rendezvous.clone());
        if let Some(timeout) = self.claim_timeout {
            handler = handler.with_claim_timeout(timeout);
        }
        let tunnel = Tunnel::new(config.clone(), Arc::new(handler));
        tunnel.set_control_stream(Arc::new(FramedControlStream::new(socket)))?;

        // A reconnecting agent replaces the previous session
        let previous = self.active().insert(tunnel_id.clone(), tunnel.clone());
        if let Some(previous) = previous {
            info!(tunnel_id = %tunnel_id, "Agent reconnected, replacing session");
            previous.stop().await;
            previous.wait().await;
            self.forget_streams(&tunnel_id);
        }

        let result = self.run_session(&tunnel, &config, shutdown).await;

        tunnel.stop().await;
        tunnel.wait().await;
        {
            let mut active = self.active();
            if active
                .get(&tunnel_id)
                .is_some_and(|current| Arc::ptr_eq(current, &tunnel))
            {
                active.remove(&tunnel_id);
                drop(active);
                self.forget_streams(&tunnel_id);
            }
        }
        info!(tunnel_id = %tunnel_id, agent = %peer_addr, "Agent session ended");
        result
    }

    /// Connection ids restart with every session; drop what the last one left behind
    fn forget_streams(&self, tunnel_id: &str) {
        let purged = self.rendezvous.purge_tunnel(tunnel_id);
        if purged > 0 {
            debug!(tunnel_id = %tunnel_id, purged, "Dropped data streams of previous session");
        }
    }

    async fn run_session(
        &self,
        tunnel: &Arc<Tunnel>,
        config: &TunnelConfig,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if config.direction == Direction::Reverse {
            let addr = tunnel
                .add_listener(config.listen.port(), config.endpoint_id.clone())
                .await?;
            info!(tunnel_id = %config.id, "Relay accepting tunnel clients on {}", addr);
        }
        tunnel.start()?;

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tunnel.ingress_closed() => {}
        }
        Ok(())
    }
}
