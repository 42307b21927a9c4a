use std::sync::Arc;

use anyhow::Context;
use hushrooms::{
    AppState,
    cleanup::CleanupScheduler,
    config::Config,
    liveness::SystemClock,
    router,
    store::{MemoryStore, SessionStore, SqliteStore},
};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hushrooms=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("reading configuration")?;

    let store: Arc<dyn SessionStore> = if config.uses_memory_store() {
        info!("using in-memory session store");
        Arc::new(MemoryStore::new())
    } else {
        let db_pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;

        let store = SqliteStore::new(db_pool);
        store.migrate().await.context("creating schema")?;
        info!(database_url = %config.database_url, "using sqlite session store");
        Arc::new(store)
    };

    let app_state = AppState::new(&config, store, Arc::new(SystemClock));

    let sweeper = CleanupScheduler::new(app_state.lifecycle.clone(), config.cleanup_interval).spawn();

    let app = router(app_state, &config.cors_origins);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();
    info!("shut down");
    served.context("serving")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
