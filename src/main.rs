//! gTunnel CLI - reverse and forward TCP tunnels through a relay
//!
//! Run `gtunnel relay` on a publicly reachable host and `gtunnel agent` next to
//! the private services; both read the same tunnel list.

mod agent;
mod config;
mod relay;

use crate::agent::Backoff;
use crate::config::ConfigFile;
use crate::relay::Relay;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// gTunnel - TCP tunnels multiplexed over one control connection
#[derive(Parser, Debug)]
#[command(name = "gtunnel")]
#[command(about = "gTunnel - TCP tunnels multiplexed over one control connection")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level filter (overrides --verbose), e.g. "info,gtunnel_tunnel=debug"
    #[arg(long, global = true, env = "GTUNNEL_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent connections and serve the configured tunnels
    #[command(long_about = r#"
Accept agent control and data connections on one port. Reverse tunnels
listen here; forward tunnels dial their destination from here.

EXAMPLES:
  gtunnel relay --bind 0.0.0.0:4443 --config tunnels.yaml

ENVIRONMENT VARIABLES:
  GTUNNEL_BIND    Address to accept agents on
  GTUNNEL_CONFIG  Tunnel list (YAML)
    "#)]
    Relay {
        /// Address to accept agents on
        #[arg(long, env = "GTUNNEL_BIND", default_value = "0.0.0.0:4443")]
        bind: String,

        /// Tunnel list (YAML)
        #[arg(long, env = "GTUNNEL_CONFIG")]
        config: PathBuf,

        /// Seconds a connection waits for the agent's data stream
        #[arg(long, default_value = "30")]
        claim_timeout: u64,
    },

    /// Attach the configured tunnels to a relay
    #[command(long_about = r#"
Connect every configured tunnel to the relay and keep it attached,
reconnecting with exponential backoff when the control connection drops.

EXAMPLES:
  gtunnel agent --relay relay.example.com:4443 --config tunnels.yaml

ENVIRONMENT VARIABLES:
  GTUNNEL_RELAY   Relay address
  GTUNNEL_CONFIG  Tunnel list (YAML)
    "#)]
    Agent {
        /// Relay address (e.g., relay.example.com:4443)
        #[arg(long, env = "GTUNNEL_RELAY")]
        relay: String,

        /// Tunnel list (YAML)
        #[arg(long, env = "GTUNNEL_CONFIG")]
        config: PathBuf,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool, log_level: Option<&str>) -> Result<()> {
    let log_level = log_level.unwrap_or(if verbose { "debug" } else { "info" });

    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Cancel `shutdown` on Ctrl+C
fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });
}

async fn run_relay(bind: String, config: ConfigFile, claim_timeout: Duration) -> Result<()> {
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind relay on {}", bind))?;

    for tunnel in &config.tunnels {
        info!(
            "Tunnel {} ({}): listen {} -> destination {}",
            tunnel.id,
            tunnel.direction.as_str(),
            tunnel.listen,
            tunnel.destination
        );
    }

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    let relay = Arc::new(Relay::new(config.tunnels).with_claim_timeout(claim_timeout));
    relay.serve(listener, shutdown).await;
    Ok(())
}

async fn run_agent(relay: String, config: ConfigFile, backoff: Backoff) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    let mut sessions = JoinSet::new();
    for tunnel in config.tunnels {
        info!(
            "Tunnel {} ({}): listen {} -> destination {}",
            tunnel.id,
            tunnel.direction.as_str(),
            tunnel.listen,
            tunnel.destination
        );
        sessions.spawn(agent::run_with_reconnect(
            relay.clone(),
            tunnel,
            backoff.clone(),
            shutdown.clone(),
        ));
    }

    let mut failure = None;
    while let Some(result) = sessions.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Tunnel error: {:#}", e);
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!("Tunnel task panicked: {}", e);
                failure.get_or_insert(e.into());
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Relay {
            bind,
            config,
            claim_timeout,
        } => {
            info!("gTunnel relay starting...");
            let config = ConfigFile::load(&config)?;
            run_relay(bind, config, Duration::from_secs(claim_timeout)).await?;
        }
        Commands::Agent {
            relay,
            config,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            info!("gTunnel agent starting...");
            info!("Relay: {}", relay);
            let config = ConfigFile::load(&config)?;
            let backoff = Backoff::new(
                Duration::from_secs(reconnect_delay),
                Duration::from_secs(max_reconnect_delay),
                max_reconnect_attempts,
            );
            run_agent(relay, config, backoff).await?;
        }
    }

    info!("gTunnel stopped");
    Ok(())
}
