//! Backhaul agent CLI
//!
//! Runs behind NAT/firewall, opens outbound tunnel connections to the
//! broker and executes forwarded requests against local upstreams.

use anyhow::{Context, Result};
use backhaul_agent::{router, AgentConfig, AgentState, Client};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul agent - exposes local HTTP services through a public broker
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Backhaul agent - exposes local HTTP services through a public broker")]
#[command(version)]
#[command(long_about = r#"
The Backhaul agent opens outbound tunnel connections to a broker, which
forwards external HTTP requests back through them for execution against
services in your private network.

EXAMPLES:
  # Connect with an inline secret
  backhaul-agent --broker ws://broker.example.com:8080/register \
    --secret $BACKHAUL_SECRET

  # Start using a config file
  backhaul-agent --config agent-config.yaml

ENVIRONMENT VARIABLES:
  BACKHAUL_BROKER  Broker register URL
  BACKHAUL_SECRET  Peer credential
"#)]
struct Args {
    /// Broker register URL (e.g. ws://broker.example.com:8080/register)
    #[arg(long, env = "BACKHAUL_BROKER")]
    broker: Option<String>,

    /// Peer credential
    #[arg(long, env = "BACKHAUL_SECRET")]
    secret: Option<String>,

    /// Bind address for the local HTTP server (host:port)
    #[arg(long, env = "BACKHAUL_LISTEN")]
    listen: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

/// Merge CLI args over the config file.
fn build_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            AgentConfig::load(path)?
        }
        None => AgentConfig::default(),
    };

    if let Some(broker) = &args.broker {
        config.broker_url = broker.clone();
    }
    if let Some(secret) = &args.secret {
        config.secret = Some(secret.clone());
    }
    if let Some(listen) = &args.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .context("Invalid --listen value (expected host:port)")?;
        config.host = host.to_string();
        config.port = port.parse().context("Invalid port in --listen value")?;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    info!("Backhaul agent starting...");

    let config = build_config(&args)?;
    let credentials = config.credentials()?;

    info!("Broker: {}", config.broker_url);
    info!("Local endpoint: {}", config.addr());

    let client = Arc::new(Client::new(&config, credentials));
    client.start();

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("Unable to bind {}", config.addr()))?;

    let server = axum::serve(
        listener,
        router(AgentState {
            client: client.clone(),
        }),
    );

    tokio::select! {
        result = server => {
            result.context("Agent server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    client.shutdown().await;
    info!("Agent stopped");
    Ok(())
}
