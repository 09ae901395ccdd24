//! iaptunnel - expose remote instance ports on loopback through the relay
//!
//! `start` opens a tunnel and keeps it open until Ctrl+C; `probe` checks
//! whether the relay accepts the credential for a destination.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iaptunnel_client::{RelayPolicy, StaticCredential, TunnelEvent, TunnelService};
use iaptunnel_proto::{InstanceLocator, TunnelDestination};
use iaptunnel_transport_tls::TlsConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{load_config_file, resolve_settings, ConfigFile, RelayArgs, Settings};

/// iaptunnel - reach instance ports through the identity-aware relay
#[derive(Parser, Debug)]
#[command(name = "iaptunnel")]
#[command(about = "iaptunnel - reach instance ports through the identity-aware relay")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
iaptunnel listens on a loopback port and forwards every local connection to a
port on a remote instance through the relay, authenticating with a bearer
token and, for enrolled devices, a client certificate.

EXAMPLES:
  # Forward RDP of instance-a to a local port
  iaptunnel --relay tunnel.example.com:443 --token $TOKEN \
    start --instance projects/my-project/zones/us-central1-a/instances/instance-a \
    --port 3389 --local-port 13389

  # Check access without opening a tunnel
  iaptunnel --config iaptunnel.yaml probe \
    --instance projects/my-project/zones/us-central1-a/instances/instance-a --port 22

ENVIRONMENT VARIABLES:
  IAPTUNNEL_RELAY        Relay endpoint address
  IAPTUNNEL_TOKEN        Bearer token
  IAPTUNNEL_CLIENT_CERT  Client certificate chain (PEM)
  IAPTUNNEL_CLIENT_KEY   Client certificate key (PEM)
  IAPTUNNEL_CONFIG       Configuration file (YAML)
"#)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "IAPTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    relay: RelayArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a tunnel and forward local connections until interrupted
    Start {
        /// Instance path (projects/P/zones/Z/instances/I)
        #[arg(long)]
        instance: InstanceLocator,

        /// Port on the instance
        #[arg(long)]
        port: u16,

        /// Local loopback port (0 picks a free port)
        #[arg(long, default_value = "0")]
        local_port: u16,

        /// Who may use the tunnel: same-process, current-user or any-local-user
        #[arg(long)]
        policy: Option<String>,
    },

    /// Check that the relay accepts a destination, then disconnect
    Probe {
        /// Instance path (projects/P/zones/Z/instances/I)
        #[arg(long)]
        instance: InstanceLocator,

        /// Port on the instance
        #[arg(long)]
        port: u16,

        /// Give up after this many seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn build_service(settings: &Settings) -> Result<TunnelService> {
    let connector =
        TlsConnector::new(settings.tls.clone()).context("Failed to create relay connector")?;

    Ok(TunnelService::new(
        Arc::new(connector),
        settings.relay_config.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let settings = resolve_settings(cli.relay, file).context("Failed to build configuration")?;
    info!(
        "Relay: {}:{}",
        settings.tls.relay_host, settings.tls.relay_port
    );

    match cli.command {
        Commands::Start {
            instance,
            port,
            local_port,
            policy,
        } => {
            let policy_name = policy
                .or_else(|| settings.default_policy.clone())
                .unwrap_or_else(|| "current-user".to_string());
            let policy: RelayPolicy = policy_name
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;

            start(&settings, TunnelDestination::new(instance, port), policy, local_port).await
        }
        Commands::Probe {
            instance,
            port,
            timeout_secs,
        } => {
            probe(
                &settings,
                TunnelDestination::new(instance, port),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

async fn start(
    settings: &Settings,
    destination: TunnelDestination,
    policy: RelayPolicy,
    local_port: u16,
) -> Result<()> {
    let service = build_service(settings)?;
    let credentials = Arc::new(StaticCredential::new(settings.credential.clone()));

    let tunnel = service
        .create_tunnel_on_port(destination.clone(), policy, credentials, local_port)
        .await
        .context("Failed to start tunnel")?;

    info!("✅ Tunnel to {} ({})", destination, policy);
    info!("Listening on {}", tunnel.local_addr());

    let mut events = tunnel.subscribe();

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        reason = watch_events(&mut events) => {
            error!("Tunnel failed: {}", reason);
            Err(anyhow::anyhow!("Tunnel failed: {}", reason))
        }
    };

    service.shutdown().await;
    info!("iaptunnel stopped");
    result
}

/// Log tunnel events until the tunnel fails
async fn watch_events(events: &mut broadcast::Receiver<TunnelEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::Accepted { peer }) => {
                debug!("Local connection from {} accepted", peer.addr);
            }
            Ok(TunnelEvent::RejectedByPolicy { peer }) => {
                warn!(
                    "Local connection from {} (pid {:?}) rejected by relay policy",
                    peer.addr, peer.pid
                );
            }
            Ok(TunnelEvent::ConnectionFailed { peer, error }) => {
                warn!("Relay connection for {} failed: {}", peer, error);
            }
            Ok(TunnelEvent::ConnectionClosed { peer, error }) => match error {
                Some(error) => warn!("Connection from {} ended: {}", peer, error),
                None => debug!("Connection from {} closed", peer),
            },
            Ok(TunnelEvent::TunnelFailed { reason }) => return reason,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Skipped {} tunnel events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return "tunnel event channel closed".to_string();
            }
        }
    }
}

async fn probe(settings: &Settings, destination: TunnelDestination, timeout: Duration) -> Result<()> {
    let service = build_service(settings)?;
    let credentials = Arc::new(StaticCredential::new(settings.credential.clone()));

    info!("Probing {}", destination);

    match service.probe(destination.clone(), credentials, timeout).await {
        Ok(()) => {
            info!("✅ Relay accepted {}", destination);
            Ok(())
        }
        Err(e) if e.is_unauthorized() => {
            error!("Access to {} denied: {}", destination, e);
            Err(anyhow::anyhow!("Access denied: {}", e))
        }
        Err(e) => {
            error!("Probe of {} failed: {}", destination, e);
            Err(anyhow::anyhow!("Probe failed: {}", e))
        }
    }
}
