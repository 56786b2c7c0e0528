//! # Switchboard server
//!
//! Real-time message-routing exchange.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! switchboard
//!
//! # Run with environment variables
//! SWITCHBOARD_PORT=7200 SWITCHBOARD_HOST=0.0.0.0 switchboard
//! ```
//!
//! Configuration is read from `switchboard.toml` (working directory,
//! `/etc/switchboard/`, or `~/.config/switchboard/`) with
//! `SWITCHBOARD_*` environment overrides.

mod config;
mod federation;
mod handlers;
mod metrics;
mod wake_exec;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchboard_core::Exchange;
use wake_exec::HandlerWakeExecutor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    info!("starting switchboard on {}:{}", config.host, config.port);

    if config.tls.is_some() {
        warn!("tls.cert_path/key_path are set but TLS termination is delegated to the fronting transport");
    }

    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("failed to start metrics server: {e}");
        }
    }

    let exchange = Exchange::new(config.exchange_config(), Arc::new(HandlerWakeExecutor::new()));
    let sweeper = exchange.spawn_sweeper();

    let federation = if config.federation.enabled {
        info!(peer = %config.federation.peer_url, "federation enabled");
        Some(federation::spawn(
            Arc::clone(&exchange),
            config.federation.clone(),
        ))
    } else {
        None
    };

    let stats_exchange = Arc::clone(&exchange);
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            metrics::publish_stats(&stats_exchange.stats());
        }
    });

    handlers::run_server(config, Arc::clone(&exchange)).await?;

    // Graceful teardown: stop the federation link, then hang up everyone.
    if let Some((handle, shutdown)) = federation {
        let _ = shutdown.send(true);
        let _ = handle.await;
    }
    exchange.shutdown();
    sweeper.abort();
    stats_task.abort();
    info!("switchboard stopped");

    Ok(())
}
