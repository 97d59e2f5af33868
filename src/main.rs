//! # cube-app-service
//!
//! Relay between the locker controller, mock lockers and app sessions.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cube_relay::{RelayConfig, DEFAULT_ENV_FILE};
use cube_telemetry::TelemetryConfig;

/// Cube app service.
#[derive(Parser, Debug)]
#[command(name = "cube-app-service", about = "Relay between locker controller and apps")]
struct Cli {
    /// Host to listen on.
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on (0 for auto-assign).
    #[arg(short, long)]
    port: Option<u16>,

    /// Host of the locker controller.
    #[arg(long)]
    controller_host: Option<String>,

    /// Port of the locker controller.
    #[arg(long)]
    controller_port: Option<u16>,

    /// Defaults file with KEY=VALUE lines. Missing files are ignored.
    #[arg(long, env = "CUBE_ENV_FILE", default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log JSON lines instead of text.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Layer CLI flags over the loaded configuration.
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.controller_host {
            config.controller_host.clone_from(host);
        }
        if let Some(port) = self.controller_port {
            config.controller_port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        json: cli.json_logs,
        ..TelemetryConfig::from_verbosity(cli.verbose)
    };
    let _ = cube_telemetry::init_telemetry(&telemetry);

    let mut config = RelayConfig::load(Some(&cli.env_file))
        .with_context(|| format!("Failed to load configuration from {}", cli.env_file.display()))?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        listen = %config.listen_addr(),
        controller = %config.controller_url(),
        "Starting cube app service"
    );

    let relay = cube_relay::start(config)
        .await
        .context("Failed to start relay")?;
    relay
        .run_until(shutdown_signal())
        .await
        .context("Relay stopped with an error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
