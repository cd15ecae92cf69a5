//! stpcli: tunnel client
//!
//! Logs in to an stp broker and keeps a reverse SSH tunnel from the
//! assigned public port to a local service, reconnecting forever.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stp_client::ControlClient;
use stp_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "stpcli")]
#[command(about = "stp client: expose a local port through an stp broker")]
#[command(version)]
struct Args {
    /// Name reported to the broker (defaults to the hostname)
    #[arg(short, long)]
    name: Option<String>,

    /// Broker control channel URL, e.g. ws://broker.example.net:10000
    #[arg(short, long)]
    server: Option<String>,

    /// Local port to expose
    #[arg(short, long)]
    port: Option<u16>,

    /// Auth key shared with the broker
    #[arg(long, env = "STP_AUTH_KEY")]
    key: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(args.config.as_ref())?;
    if let Some(name) = args.name {
        config.name = name;
    }
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(port) = args.port {
        config.local_port = port;
    }
    if let Some(key) = args.key {
        config.auth_key = key;
    }

    tracing::info!(
        "stp client {} exposing {} via {}",
        config.name,
        config.local_endpoint(),
        config.server_url
    );

    let mut client = ControlClient::new(config);
    tokio::select! {
        _ = client.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, exiting");
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<ClientConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_dir().join("client.toml");
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        Ok(ClientConfig::default())
    }
}
