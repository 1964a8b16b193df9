//! Upstream Relay - Entry Point
//!
//! Starts the relay server and the admin API with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use upstream_relay::api::ApiServer;
use upstream_relay::config::{Config, LogConfig};
use upstream_relay::{ProxyServer, Relay, Result, UpstreamPool};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Upstream Relay");

    let pool = Arc::new(UpstreamPool::new(config.upstream.endpoints.clone())?);
    for endpoint in pool.endpoints() {
        info!(id = endpoint.id, upstream = %endpoint.address(), "Loaded upstream proxy");
    }
    info!("Loaded {} upstream proxies", pool.len());

    let relay = Arc::new(Relay::new(pool.clone(), config.relay_config())?);

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    let relay_server = ProxyServer::new(config.relay.clone(), relay);
    let relay_shutdown = shutdown_tx.subscribe();
    let relay_task = tokio::spawn(async move {
        if let Err(e) = relay_server.run(relay_shutdown).await {
            error!("Relay server error: {}", e);
        }
    });

    let api_task = if config.api.enabled {
        let api_server = ApiServer::new(config.api.clone(), pool.clone());
        let api_shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = api_server.run(api_shutdown).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    info!(
        "Servers started - Relay: {}, API: {}",
        config.relay.addr(),
        if config.api.enabled {
            config.api.addr()
        } else {
            "disabled".to_string()
        }
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);

    let _ = relay_task.await;
    if let Some(task) = api_task {
        let _ = task.await;
    }

    info!("Upstream Relay stopped");
    Ok(())
}

/// `RUST_LOG` wins over `LOG_LEVEL`; `LOG_FORMAT=json` selects JSON lines
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "upstream_relay={level},tower_http={level}",
            level = log.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
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
