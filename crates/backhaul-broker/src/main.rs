//! Backhaul broker CLI
//!
//! Public-facing side of the tunnel: accepts agent registrations and
//! forwards external HTTP requests through their pooled tunnel connections.

use anyhow::{Context, Result};
use backhaul_broker::{
    router, BrokerConfig, BrokerState, ControlPlaneAuthenticator, PeerAuthenticator, Registry,
    StaticAuthenticator, StatusReporter,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul broker - exposes tunneled HTTP services to external callers
#[derive(Parser, Debug)]
#[command(name = "backhaul-broker")]
#[command(about = "Backhaul broker - exposes tunneled HTTP services to external callers")]
#[command(version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Bind address override (host:port)
    #[arg(long, env = "BACKHAUL_LISTEN")]
    listen: Option<String>,

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

fn build_authenticator(
    config: &BrokerConfig,
    http: reqwest::Client,
) -> Arc<dyn PeerAuthenticator> {
    match &config.validate_url {
        Some(url) => {
            info!(%url, "Validating peer credentials against control plane");
            Arc::new(ControlPlaneAuthenticator::new(http, url.clone()))
        }
        None => {
            info!(
                peers = config.static_peers.len(),
                "Validating peer credentials against static table"
            );
            Arc::new(StaticAuthenticator::new(config.static_peers.clone()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            BrokerConfig::load(path)?
        }
        None => BrokerConfig::default(),
    };

    if let Some(listen) = &args.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .context("Invalid --listen value (expected host:port)")?;
        config.host = host.to_string();
        config.port = port.parse().context("Invalid port in --listen value")?;
    }

    let http = reqwest::Client::new();
    let registry = Registry::new(config.pool_config(), http.clone());
    registry.spawn_sweeper(config.sweep_interval());

    if let Some(report_url) = &config.report_url {
        StatusReporter::new(
            registry.clone(),
            http.clone(),
            report_url.clone(),
            config.report_interval(),
        )
        .spawn();
    }

    let state = BrokerState {
        registry: registry.clone(),
        authenticator: build_authenticator(&config, http),
    };

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("Unable to bind {}", config.addr()))?;
    info!("Broker listening on {}", config.addr());

    let server = axum::serve(listener, router(state));

    tokio::select! {
        result = server => {
            result.context("Broker server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    registry.shutdown().await;
    info!("Broker stopped");
    Ok(())
}
