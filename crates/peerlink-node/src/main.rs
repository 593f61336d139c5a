//! `peerlink` — run a bus broker, an echo server or a request-issuing client.
//!
//! # Usage
//!
//! ```text
//! peerlink [OPTIONS] <COMMAND>
//!
//! Commands:
//!   broker   Run the coordination bus broker
//!   server   Run a server node that echoes every request payload
//!   client   Run a client node that pairs with a server and sends requests
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --log-level <LEVEL>    Overrides node.log_level
//!   --bus <HOST:PORT>      Overrides network.bus_address
//!   --prefix <PREFIX>      Overrides network.prefix
//!   --host <IP>            Overrides network.interface
//! ```
//!
//! Every option can also be given as a `PEERLINK_*` environment variable
//! (`PEERLINK_CONFIG`, `PEERLINK_LOG_LEVEL`, `PEERLINK_BUS`, `PEERLINK_PREFIX`,
//! `PEERLINK_HOST`).  CLI args take precedence over the environment, which takes
//! precedence over the config file.
//!
//! # A three-terminal demo
//!
//! ```text
//! peerlink broker
//! peerlink server
//! peerlink client --payload '{"hello":"world"}' --count 3
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerlink_core::{Envelope, Role};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use peerlink_node::application::dispatch::HandlerError;
use peerlink_node::application::peer_node::PeerNode;
use peerlink_node::infrastructure::bus::BusBroker;
use peerlink_node::infrastructure::connect;
use peerlink_node::infrastructure::storage::config::{
    default_config_path, load_config_from, AppConfig, ConfigError,
};

/// How often the client checks whether it has paired.
const PAIR_POLL: Duration = Duration::from_millis(200);
/// How often an unpaired client re-announces itself.
const REANNOUNCE_EVERY: Duration = Duration::from_secs(5);
/// How long the client waits for each reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "peerlink",
    about = "Bus-coordinated push/pull peer messaging",
    version
)]
struct Cli {
    /// Path of the TOML config file.
    #[arg(long, global = true, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, env = "PEERLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Address of the bus broker (`host:port`).
    #[arg(long, global = true, env = "PEERLINK_BUS")]
    bus: Option<String>,

    /// Channel prefix; only nodes sharing a prefix pair with each other.
    #[arg(long, global = true, env = "PEERLINK_PREFIX")]
    prefix: Option<String>,

    /// IP address to bind push sockets on and advertise to peers.
    #[arg(long, global = true, env = "PEERLINK_HOST")]
    host: Option<IpAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the coordination bus broker.
    Broker {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:24900")]
        listen: String,
    },

    /// Run a server node that echoes every request payload.
    Server,

    /// Run a client node that pairs with a server and sends requests.
    Client {
        /// JSON payload of each request.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Number of requests to send.
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Pause between requests in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

impl Cli {
    /// Loads the config file and applies CLI/env overrides on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    fn resolve_config(&self) -> anyhow::Result<AppConfig> {
        let path = match &self.config {
            Some(path) => Some(path.clone()),
            None => match default_config_path() {
                Ok(path) => Some(path),
                Err(ConfigError::NoPlatformConfigDir) => None,
                Err(e) => return Err(e.into()),
            },
        };
        let mut config = match &path {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => AppConfig::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(level) = &self.log_level {
            config.node.log_level = level.clone();
        }
        if let Some(bus) = &self.bus {
            config.network.bus_address = bus.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.network.prefix = Some(prefix.clone());
        }
        if let Some(host) = self.host {
            config.network.interface = Some(host.to_string());
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    match cli.command {
        Command::Broker { listen } => run_broker(&listen).await,
        Command::Server => run_server(&config).await,
        Command::Client {
            payload,
            count,
            interval_ms,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .with_context(|| format!("--payload is not valid JSON: {payload}"))?;
            run_client(&config, payload, count, Duration::from_millis(interval_ms)).await
        }
    }
}

async fn run_broker(listen: &str) -> anyhow::Result<()> {
    let broker = BusBroker::bind(listen)
        .await
        .with_context(|| format!("failed to bind bus broker on {listen}"))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    broker.run(running).await;
    info!("bus broker stopped");
    Ok(())
}

async fn build_node(role: Role, config: &AppConfig) -> anyhow::Result<PeerNode> {
    let options = config.to_node_options().context("invalid configuration")?;
    let bus = options.bus_address.clone();
    connect(role, options)
        .await
        .with_context(|| format!("failed to reach the bus at {bus}"))
}

async fn run_server(config: &AppConfig) -> anyhow::Result<()> {
    let node = build_node(Role::Server, config).await?;
    node.start(|envelope: Envelope| async move {
        Ok::<_, HandlerError>(envelope.payload.unwrap_or(Value::Null))
    })
    .await
    .context("failed to start server node")?;
    info!("server {} on {} is waiting for clients", node.id(), node.host());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C signal")?;
    info!("received Ctrl+C; shutting down");
    node.stop().await;
    Ok(())
}

async fn run_client(
    config: &AppConfig,
    payload: Value,
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let node = build_node(Role::Client, config).await?;
    node.start(|envelope: Envelope| async move {
        info!("unsolicited message: {:?}", envelope.payload);
        Ok::<_, HandlerError>(Value::Null)
    })
    .await
    .context("failed to start client node")?;

    let outcome = tokio::select! {
        result = issue_requests(&node, payload, count, interval) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C signal")?;
            info!("received Ctrl+C; shutting down");
            Ok(())
        }
    };
    node.stop().await;
    outcome
}

async fn issue_requests(
    node: &PeerNode,
    payload: Value,
    count: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let address = wait_for_pair(node).await?;
    info!("paired; sending {count} request(s) to {address}");

    for n in 1..=count {
        match tokio::time::timeout(REPLY_TIMEOUT, node.request(&address, payload.clone())).await {
            Ok(Ok(reply)) => match reply_outcome(reply) {
                Ok(value) => info!("reply {n}: {value}"),
                Err(message) => warn!("request {n} failed remotely: {message}"),
            },
            Ok(Err(e)) => return Err(e).with_context(|| format!("request {n} failed")),
            Err(_) => warn!("request {n} timed out after {REPLY_TIMEOUT:?}"),
        }
        if n < count {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

/// The reply's payload, or the error message the server sent instead.
fn reply_outcome(reply: Envelope) -> Result<Value, String> {
    match reply.error {
        Some(message) => Err(message),
        None => Ok(reply.payload.unwrap_or(Value::Null)),
    }
}

/// Waits until the node has a pair, re-announcing periodically, and returns
/// the push address to send on.
async fn wait_for_pair(node: &PeerNode) -> anyhow::Result<String> {
    let mut since_announce = Duration::ZERO;
    loop {
        if let Some(pair) = node.pairs().await.into_iter().next() {
            return Ok(pair.push_address);
        }
        tokio::time::sleep(PAIR_POLL).await;
        since_announce += PAIR_POLL;
        if since_announce >= REANNOUNCE_EVERY {
            since_announce = Duration::ZERO;
            info!("no server answered yet; announcing again");
            node.announce().await.context("failed to re-announce")?;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_default_listen_address() {
        let cli = Cli::parse_from(["peerlink", "broker"]);
        match cli.command {
            Command::Broker { listen } => assert_eq!(listen, "127.0.0.1:24900"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_client_defaults() {
        let cli = Cli::parse_from(["peerlink", "client"]);
        match cli.command {
            Command::Client {
                payload,
                count,
                interval_ms,
            } => {
                assert_eq!(payload, "{}");
                assert_eq!(count, 1);
                assert_eq!(interval_ms, 1000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::parse_from(["peerlink", "server", "--prefix", "orders", "--host", "10.0.0.2"]);
        assert!(matches!(cli.command, Command::Server));
        assert_eq!(cli.prefix.as_deref(), Some("orders"));
        assert_eq!(cli.host, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_overrides_replace_config_values() {
        // Arrange
        let cli = Cli::parse_from([
            "peerlink",
            "--log-level",
            "debug",
            "--bus",
            "10.0.0.1:7000",
            "--prefix",
            "staging",
            "--host",
            "10.0.0.9",
            "server",
        ]);
        let mut config = AppConfig::default();

        // Act
        cli.apply_overrides(&mut config);

        // Assert
        assert_eq!(config.node.log_level, "debug");
        assert_eq!(config.network.bus_address, "10.0.0.1:7000");
        assert_eq!(config.network.prefix.as_deref(), Some("staging"));
        assert_eq!(config.network.interface.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_no_overrides_keep_config_values() {
        let cli = Cli::parse_from(["peerlink", "server"]);
        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_reply_outcome_prefers_the_remote_error() {
        let ok = Envelope::request(serde_json::json!({"echo": 1}));
        assert_eq!(reply_outcome(ok), Ok(serde_json::json!({"echo": 1})));

        let failed = Envelope::request(serde_json::json!(1)).respond_err("no such order");
        assert_eq!(reply_outcome(failed), Err("no such order".to_string()));

        let empty = Envelope::default();
        assert_eq!(reply_outcome(empty), Ok(Value::Null));
    }

    #[test]
    fn test_invalid_host_is_rejected_by_parser() {
        let result = Cli::try_parse_from(["peerlink", "--host", "not-an-ip", "server"]);
        assert!(result.is_err());
    }
}
