//! # solo-gateway
//!
//! Single-session gateway binary: loads settings, wires the session core
//! and starts the HTTP/WebSocket server.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use solo_server::auth::{StaticAuthenticator, TokenIssuer};
use solo_server::config::ServerConfig;
use solo_server::server::SoloServer;
use solo_settings::SoloSettings;

/// Single-session gateway server.
#[derive(Parser, Debug)]
#[command(name = "solo-gateway", about = "Single-active-session gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.solo/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn load_settings(&self) -> Result<SoloSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(solo_settings::settings_path);
        let mut settings = solo_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

fn build_server(
    settings: &SoloSettings,
    metrics: solo_server::metrics::PrometheusHandle,
) -> SoloServer {
    let config = ServerConfig::from_settings(settings);
    let authenticator = Arc::new(StaticAuthenticator::new(&settings.auth.accounts));
    let tokens = TokenIssuer::from_settings(&settings.auth);
    SoloServer::new(config, authenticator, tokens, metrics)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    solo_core::logging::init_subscriber(
        settings.logging.level.as_filter_str(),
        settings.logging.format(),
    );

    let metrics = solo_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = build_server(&settings, metrics);

    let addr = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!(
        accounts = settings.auth.accounts.len(),
        stale_after_ms = server.config().stale_after.as_millis(),
        "solo gateway listening on http://{addr}"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server.shutdown_gracefully().await;
    tracing::info!(
        closed_sessions = report.closed_sessions,
        clean = report.is_clean(),
        "shutdown complete"
    );
    Ok(())
}
