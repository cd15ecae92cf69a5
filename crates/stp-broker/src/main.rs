//! stpsrv: broker daemon and operator tool
//!
//! `stpsrv serve` runs the broker: the WebSocket control channel, the
//! operator listing, the liveness supervisor and, when configured, the
//! embedded SSH endpoint. `list` and `connect` talk to a running broker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stp_broker::keys::KeyMaterial;
use stp_broker::ssh::{load_or_generate_host_key, ForwardPolicy, SshEndpoint};
use stp_broker::{http, operator, BrokerState, LivenessSupervisor};
use stp_core::config::{self, BrokerConfig};

#[derive(Parser)]
#[command(name = "stpsrv")]
#[command(about = "stp broker: public ports for reverse SSH tunnels")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default)
    Serve {
        /// Control channel listen address (overrides config)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// List logged-in clients of a running broker
    #[command(alias = "ls")]
    List,

    /// SSH into a client through its tunnel
    Connect {
        /// Client number as shown by `list`
        num: usize,

        /// Login user on the client
        #[arg(short, long, default_value = "root")]
        user: String,
    },
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

    let config = load_config(args.config.as_ref())?;

    match args.command.unwrap_or(Commands::Serve { listen: None }) {
        Commands::Serve { listen } => serve(config, listen).await,
        Commands::List => {
            let clients = operator::fetch_clients(&config.listen_address).await?;
            println!("{}", operator::format_clients(&clients));
            Ok(())
        }
        Commands::Connect { num, user } => {
            operator::connect(&config.listen_address, num, &user).await
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<BrokerConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_dir().join("broker.toml");
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        tracing::debug!("Using default configuration");
        Ok(BrokerConfig::default())
    }
}

async fn serve(mut config: BrokerConfig, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.listen_address = listen;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!("stp broker starting...");

    let keys = KeyMaterial::load(&config.private_key_path(), &config.public_key_path())
        .context("Failed to load SSH key material")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let state = Arc::new(BrokerState::new(config.clone(), keys));

    let supervisor = LivenessSupervisor::new(Arc::clone(&state));
    let supervisor_task = tokio::spawn(supervisor.run(cancel.clone()));

    let ssh_task = match &config.ssh_server {
        Some(ssh) => {
            let host_key = load_or_generate_host_key(&ssh.host_key_path)?;
            let policy = ForwardPolicy {
                user: config.ssh_user.clone(),
                key_fingerprint: state.keys.parsed_public_key()?.fingerprint(),
                range: config.port_range,
            };
            let listener = TcpListener::bind(&ssh.bind_address)
                .await
                .with_context(|| format!("Failed to bind SSH endpoint to {}", ssh.bind_address))?;
            let endpoint = SshEndpoint::new(host_key, policy, cancel.clone());
            Some(tokio::spawn(async move { endpoint.run(listener).await }))
        }
        None => {
            tracing::info!("Using external SSH server at {}", config.ssh_address);
            None
        }
    };

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_address))?;
    http::serve(listener, Arc::clone(&state), cancel.clone()).await?;

    cancel.cancel();
    let _ = supervisor_task.await;
    if let Some(task) = ssh_task {
        task.await??;
    }

    tracing::info!("Broker shutdown complete");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
