//! Operator commands: list logged-in clients and SSH into one of them

use std::time::Duration;

use anyhow::{Context, Result};
use stp_core::Endpoint;
use tabled::{settings::Style, Table, Tabled};

use crate::http::SHOW_CLIENT_PATH;
use crate::registry::ClientInfo;

/// Timeout of the listing request
pub const LIST_TIMEOUT: Duration = Duration::from_secs(3);

/// URL of the operator listing for a broker listening on `listen_address`
pub fn show_client_url(listen_address: &str) -> Result<String> {
    let endpoint: Endpoint = listen_address
        .parse()
        .with_context(|| format!("Invalid listen address {}", listen_address))?;
    let host = match endpoint.host.as_str() {
        "" | "0.0.0.0" | "::" => "127.0.0.1".to_string(),
        _ => endpoint.host.clone(),
    };
    Ok(format!(
        "http://{}{}",
        Endpoint::new(host, endpoint.port),
        SHOW_CLIENT_PATH
    ))
}

/// Fetch the client listing from a running broker
pub async fn fetch_clients(listen_address: &str) -> Result<Vec<ClientInfo>> {
    let url = show_client_url(listen_address)?;
    tracing::debug!("Fetching {}", url);

    let http = reqwest::Client::builder()
        .timeout(LIST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let clients = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach broker at {}", url))?
        .error_for_status()?
        .json::<Vec<ClientInfo>>()
        .await
        .context("Invalid client listing")?;

    Ok(clients)
}

/// Format clients as a table, numbered from 0
pub fn format_clients(clients: &[ClientInfo]) -> String {
    if clients.is_empty() {
        return "No clients logged in".to_string();
    }

    #[derive(Tabled)]
    struct ClientRow {
        #[tabled(rename = "NUM")]
        num: usize,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "PORT")]
        port: u16,
        #[tabled(rename = "ADDR")]
        addr: String,
        #[tabled(rename = "ONLINE")]
        online: bool,
    }

    let rows: Vec<ClientRow> = clients
        .iter()
        .enumerate()
        .map(|(num, c)| ClientRow {
            num,
            name: c.name.clone(),
            port: c.port,
            addr: c.addr.clone(),
            online: c.is_online,
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Arguments of the `ssh` invocation reaching `client` through its tunnel
pub fn ssh_args(client: &ClientInfo, user: &str) -> Vec<String> {
    vec![
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3000".to_string(),
        "-p".to_string(),
        client.port.to_string(),
        format!("{}@127.0.0.1", user),
    ]
}

/// Run `ssh` against the client numbered `num` in the listing
pub async fn connect(listen_address: &str, num: usize, user: &str) -> Result<()> {
    let clients = fetch_clients(listen_address).await?;
    let client = clients
        .get(num)
        .with_context(|| format!("No client numbered {} ({} logged in)", num, clients.len()))?;

    tracing::info!("Connecting to {} through port {}", client.name, client.port);
    run_interactive("ssh", &ssh_args(client, user)).await
}

/// Run `program` on the operator's terminal and wait for it to exit
async fn run_interactive(program: &str, args: &[String]) -> Result<()> {
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if !status.success() {
        anyhow::bail!("{} exited with {}", program, status);
    }
    Ok(())
}
