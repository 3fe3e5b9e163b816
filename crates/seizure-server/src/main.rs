//! Seizure Server - XMPP client-to-server front door.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use seizure_xmpp::{tls, XmppServer};
use tracing::{error, info};

mod config;
mod telemetry;

use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    telemetry::init(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    info!("Seizure Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    tls::install_crypto_provider();
    let tls_acceptor = tls::load_tls_acceptor(&config.tls_cert, &config.tls_key)
        .context("Failed to load TLS material")?;

    let server = Arc::new(
        XmppServer::bind(config.xmpp_config(), tls_acceptor)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?,
    );

    let runner = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run().await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    server.stop().await;

    match runner.await {
        Ok(Ok(())) => info!("Seizure Server stopped"),
        Ok(Err(e)) => error!(error = %e, "XMPP server failed"),
        Err(e) => error!(error = %e, "XMPP server task failed"),
    }

    Ok(())
}
