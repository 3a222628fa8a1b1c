//! Process entry point: load config, wire the DEX Core, serve the REST/WS
//! frontend, and drain in-flight WebSocket connections on shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use argh::FromArgs;
use dex_proxy_core::adapter::DexAdapter;
use dex_proxy_core::config::AppConfig;
use dex_proxy_core::frontend::{self, RouteRegistry, ShutdownSignal};
use dex_proxy_core::poller::StatusPoller;
use dex_proxy_core::DexProxyApp;
use tracing::{info, warn};

/// The DEX Proxy gateway.
#[derive(FromArgs)]
struct Args {
    /// path to the TOML config file
    #[argh(option, short = 'c', default = "String::from(\"dex_proxy.toml\")")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args: Args = argh::from_env();
    let config = AppConfig::load(&args.config)?;

    let redis = match &config.redis {
        Some(redis_config) => {
            info!(url = %redis_config.url, "connecting to redis persistence layer");
            let store = redis_store::RedisStore::connect(
                redis_config.url.clone(),
                redis_config.min_pool_size,
                redis_config.max_pool_size,
                "dex_proxy",
            )
            .await?;
            Some(Arc::new(store))
        }
        None => None,
    };

    // Concrete venue adapters are out of scope here; the core runs with
    // whatever the embedding binary registers. This wires none by default.
    let adapters: HashMap<String, Arc<dyn DexAdapter>> = HashMap::new();
    if adapters.is_empty() {
        warn!("no adapters registered; every submit/cancel/amend call will return NoAdapterForVenue");
    }

    let app = Arc::new(DexProxyApp::new(config.clone(), adapters.clone(), redis));
    app.reload_from_storage().await?;

    let mut poller_handles = Vec::new();
    for (venue, adapter) in &adapters {
        info!(%venue, "starting status poller");
        let poller = StatusPoller::new(adapter.clone(), config.poller.clone());
        poller_handles.extend(poller.spawn(app.clone()));
    }

    let reaper_handle = tokio::spawn(app.subscriptions.clone().run_reaper(std::time::Duration::from_secs(5)));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let shutdown = ShutdownSignal(shutdown_tx.clone());

    let registry = RouteRegistry::new();
    let router = frontend::router(app.clone(), shutdown, &registry);
    let addr: std::net::SocketAddr = config.listen_addr.parse()?;

    info!(%addr, "dex_proxy listening");

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    reaper_handle.abort();
    for handle in poller_handles {
        handle.abort();
    }

    Ok(())
}

/// Waits for SIGTERM (or Ctrl+C) then fans the shutdown out to every open
/// WebSocket connection before axum stops accepting new ones.
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining websocket connections");
    let _ = shutdown_tx.send(());
}
