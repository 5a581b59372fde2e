use anyhow::{bail, Context};
use clap::Parser;
use socks5_tunnel::{config::Config, CertPolicy, ProxyEndpoint, Socks5Client};
use std::future::Future;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "socks5-tunnel-rs")]
#[command(about = "Open a tunnel through a local SOCKS5 proxy, optionally upgrading it to TLS")]
struct Cli {
    /// Destination host name, resolved by the proxy
    #[arg(short, long)]
    target: String,

    /// Destination port
    #[arg(short, long, default_value = "80")]
    port: u16,

    #[arg(long)]
    proxy_host: Option<String>,

    #[arg(long)]
    proxy_port: Option<u16>,

    /// Proxy as a socks5://host:port URL; overrides --proxy-host/--proxy-port
    #[arg(long)]
    proxy_url: Option<String>,

    /// Upgrade the tunnel to TLS after CONNECT
    #[arg(long)]
    tls: bool,

    /// strict, tofu or bypass
    #[arg(long)]
    cert_policy: Option<String>,

    /// Send a server.features JSON-RPC request and print the reply
    #[arg(long)]
    probe: bool,

    /// Text to send through the tunnel; the first reply chunk is printed
    #[arg(long)]
    send: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let builder = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO });
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };
    if let Some(host) = cli.proxy_host {
        config.proxy_host = host;
    }
    if let Some(port) = cli.proxy_port {
        config.proxy_port = port;
    }
    if cli.tls {
        config.encrypt = true;
    }
    if let Some(policy) = &cli.cert_policy {
        config.cert_policy = policy.parse::<CertPolicy>()?;
    }

    let endpoint = match &cli.proxy_url {
        Some(url) => ProxyEndpoint::parse_url(url)?,
        None => config.endpoint(),
    };
    let limit = config.timeout();

    info!("Opening tunnel to {}:{} via {}", cli.target, cli.port, endpoint);
    let client = tokio::time::timeout(
        limit,
        Socks5Client::open(&endpoint, config.client_options()?),
    )
    .await
    .with_context(|| format!("connecting to {} timed out", endpoint))?
    .with_context(|| format!("connecting to {}", endpoint))?;

    with_deadline(&client, limit, "method negotiation", client.connect()).await?;
    with_deadline(
        &client,
        limit,
        "CONNECT",
        client.connect_to(&cli.target, cli.port),
    )
    .await?;
    info!("Tunnel ready ({})", client.state());

    if cli.probe {
        let features =
            with_deadline(&client, limit, "feature probe", client.server_features()).await?;
        println!("{}", features.trim_end());
    }

    if let Some(payload) = &cli.send {
        let send = async {
            client.write(Some(payload.as_str())).await?;
            client.flush().await
        };
        with_deadline(&client, limit, "sending", send).await?;
        let reply = with_deadline(&client, limit, "reading reply", client.read()).await?;
        println!("{}", String::from_utf8_lossy(&reply));
    }

    client.close().await;
    Ok(())
}

/// Bound one engine step; on expiry the transport is force-closed.
async fn with_deadline<T, F>(
    client: &Socks5Client,
    limit: Duration,
    step: &str,
    fut: F,
) -> anyhow::Result<T>
where
    F: Future<Output = socks5_tunnel::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.with_context(|| format!("{} failed", step)),
        Err(_) => {
            client.shutdown_handle().close().await;
            bail!("{} timed out after {:?}", step, limit)
        }
    }
}
