//! Agent side: one control connection to the relay per configured tunnel

use anyhow::{Context, Result};
use gtunnel_proto::StreamHeader;
use gtunnel_transport::{write_header, DialStreamHandler, FramedControlStream};
use gtunnel_tunnel::{Direction, Tunnel, TunnelConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exponential reconnect delay with an optional attempt limit
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    /// 0 = infinite
    max_attempts: usize,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: usize) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            current: initial,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the limit is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }

        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        Some(delay)
    }

    /// Start over after a session that got established
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

/// Dial the relay, open a control stream for `config` and start its Tunnel
pub async fn connect(relay_addr: &str, config: &TunnelConfig) -> Result<Arc<Tunnel>> {
    let mut socket = TcpStream::connect(relay_addr)
        .await
        .with_context(|| format!("Failed to connect to relay {}", relay_addr))?;
    socket.set_nodelay(true)?;
    write_header(
        &mut socket,
        &StreamHeader::Control {
            tunnel_id: config.id.clone(),
        },
    )
    .await
    .context("Failed to send control header")?;

    let handler = DialStreamHandler::new(relay_addr, config.id.clone());
    let tunnel = Tunnel::new(config.clone(), Arc::new(handler));
    tunnel.set_control_stream(Arc::new(FramedControlStream::new(socket)))?;

    if config.direction == Direction::Forward {
        let addr = tunnel
            .add_listener(config.listen.port(), config.endpoint_id.clone())
            .await?;
        info!(tunnel_id = %config.id, "Accepting tunnel clients on {}", addr);
    }
    tunnel.start()?;

    Ok(tunnel)
}

/// Keep one tunnel attached to the relay until `shutdown` fires
pub async fn run_with_reconnect(
    relay_addr: String,
    config: TunnelConfig,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let session = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            session = connect(&relay_addr, &config) => session,
        };

        match session {
            Ok(tunnel) => {
                info!(tunnel_id = %config.id, relay = %relay_addr, "Connected to relay");
                backoff.reset();

                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tunnel.ingress_closed() => {
                        warn!(tunnel_id = %config.id, "Lost control connection to relay");
                    }
                }

                tunnel.stop().await;
                tunnel.wait().await;
                if shutdown.is_cancelled() {
                    return Ok(());
                }
            }
            Err(e) => {
                error!(tunnel_id = %config.id, "Agent error: {:#}", e);
            }
        }

        let Some(delay) = backoff.next_delay() else {
            anyhow::bail!(
                "Tunnel {} failed after {} attempts",
                config.id,
                backoff.attempt()
            );
        };
        warn!(
            tunnel_id = %config.id,
            "Reconnecting in {:?}... (attempt {})",
            delay,
            backoff.attempt() + 1
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
