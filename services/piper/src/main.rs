//! piper
//!
//! TLS-terminating TCP proxy with dynamic backend discovery.
//!
//! This service:
//! - Terminates TLS for inbound client connections
//! - Asks an HTTP directory service for the current backend host, once per connection
//! - Dials `host:target_port` in plaintext
//! - Relays bytes both ways until either side closes

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use piper::config::Config;
use piper::proxy::{tls, HttpResolver, Listener};
use piper::EventLog;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PIPER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting piper v{}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.listen_addr,
        directory_url = %config.directory_url,
        target_port = config.target_port,
        resolve_timeout_ms = config.resolve_timeout.map(|d| d.as_millis() as u64),
        connect_timeout_ms = config.connect_timeout.map(|d| d.as_millis() as u64),
        handshake_timeout_ms = config.handshake_timeout.map(|d| d.as_millis() as u64),
        idle_timeout_ms = config.idle_timeout.map(|d| d.as_millis() as u64),
        "Configuration loaded"
    );

    let acceptor = tls::load_acceptor(&config.cert_path, &config.key_path)
        .context("Failed to load TLS certificate")?;

    let resolver = HttpResolver::new(
        config.directory_url.clone(),
        config.target_port,
        config.resolve_timeout,
    )
    .context("Failed to build directory client")?;

    let (events, _drain) = EventLog::spawn(config.event_buffer);

    let listener = match Listener::bind(
        config.listener_config(),
        acceptor,
        Arc::new(resolver),
        events,
    )
    .await
    {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    listener.run().await?;
    Ok(())
}
