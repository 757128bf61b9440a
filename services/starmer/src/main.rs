//! starmer
//!
//! SOCKS4/4a/5 proxy that sends selected destinations through a SOCKS5
//! relay such as Tor and dials everything else directly.
//!
//! On startup it:
//! - Loads `starmer.ini` (creating it with defaults if missing)
//! - Checks the relay by connecting through it to a well-known host
//! - Listens for SOCKS clients and reloads the config when the file changes

use anyhow::{Context, Result};
use starmer::{ConfigSource, Service};
use starmer_socks::RelayClient;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fallback log filter variable when `RUST_LOG` is unset.
const LOG_LEVEL_ENV: &str = "STARMER_LOG_LEVEL";

#[tokio::main]
async fn main() -> Result<()> {
    // Prefer RUST_LOG, fallback to STARMER_LOG_LEVEL
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_LEVEL_ENV))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    info!("Starting starmer");

    let source = ConfigSource::locate().context("locating config file")?;
    info!(path = %source.path().display(), "Config path");

    let config = source.load().await.context("loading config")?;
    info!(
        listen_addr = %config.listen_addr,
        relay_addr = %config.relay_addr,
        pattern = %config.pattern,
        "Configuration loaded"
    );

    let relay = RelayClient::new(config.relay_addr.as_str());
    relay
        .probe()
        .await
        .with_context(|| format!("relay {} is not usable", relay.relay_addr()))?;
    info!(relay_addr = %relay.relay_addr(), "relay ok");

    Service::new(source, config).run().await?;
    Ok(())
}
