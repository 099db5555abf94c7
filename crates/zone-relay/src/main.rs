//! zone-relay: device telemetry relay.
//!
//! Accepts WebSocket clients, authenticates each one with an identifier and
//! numeric PIN, subscribes to the bound device's events upstream and streams
//! them back until either side goes away.

mod authenticator;
mod config;
mod monitor;
mod relay;
mod server;
mod store;
mod transport;
mod upstream;

#[cfg(test)]
mod testing;

use anyhow::Context;
use authenticator::Authenticator;
use clap::{Parser, Subcommand};
use config::{CliOverrides, RelayConfig};
use server::RelayServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use upstream::MqttConnector;

/// zone-relay: device telemetry relay
#[derive(Parser, Debug)]
#[command(name = "zone-relay", version, about = "Device telemetry relay")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.zone/relay.toml")]
    config: String,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// WebSocket upgrade path
    #[arg(long)]
    path: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Liveness receive interval in milliseconds
    #[arg(long)]
    liveness_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check one identifier/PIN pair against the credential store and exit
    Check {
        /// Registered identifier (e-mail)
        #[arg(long)]
        identifier: String,

        /// Numeric PIN
        #[arg(long)]
        secret: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "zone-relay failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let overrides = CliOverrides {
        host: cli.host,
        port: cli.port,
        path: cli.path,
        max_sessions: cli.max_sessions,
        liveness_interval_ms: cli.liveness_interval_ms,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = RelayConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    let store = store::build_store(&config.store)
        .await
        .context("failed to open credential store")?;
    let authenticator = Arc::new(Authenticator::new(
        store,
        Duration::from_secs(config.store.timeout_secs),
    ));

    if let Some(Command::Check { identifier, secret }) = cli.command {
        let response = authenticator.check(&identifier, &secret).await;
        println!("{} {}", response.status, response.body);
        return Ok(if response.is_success() { 0 } else { 2 });
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        upstream = %config.upstream.host,
        "starting zone-relay"
    );

    let connector = Arc::new(MqttConnector::new(config.upstream.clone()).context("invalid upstream config")?);
    let reporter = monitor::build_reporter(&config.monitor);
    let relay = RelayServer::new(config, authenticator, connector, reporter);

    let (addr, conns) = relay.listen().await.context("failed to bind listener")?;
    info!(addr = %addr, "listening");

    relay.run(conns, shutdown_signal()).await?;
    info!("zone-relay stopped");
    Ok(0)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
