use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use noxrun::api::{self, AppState};
use noxrun::config::{Config, RuntimeKind};
use noxrun::db;
use noxrun::executions::ExecutionEngine;
use noxrun::lifecycle::LifecycleManager;
use noxrun::metrics::Metrics;
use noxrun::reconcile::Reconciler;
use noxrun::runtime::{ContainerScheduler, DockerScheduler, KubernetesScheduler};
use noxrun::scheduler::Scheduler;
use noxrun::sessions::SessionManager;
use noxrun::storage::ObjectStore;
use noxrun::warm_pool::WarmPool;

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    // Use RUST_LOG if set, otherwise default to info level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("noxrun=info,tower_http=info"));

    let json_logs = std::env::var("NOXRUN_JSON_LOGS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .with_level(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;
    config.validate().map_err(|e| anyhow::anyhow!("configuration invalid: {}", e))?;
    let config = Arc::new(config);

    info!("NOXRUN Backend starting");
    info!("Environment: {}", config.server.environment);
    info!("Runtime backend: {}", config.runtime.kind);
    info!("Listening on {}", config.server.listen_addr);

    // Database is the single source of truth; refuse to start without it.
    let db_pool = db::init_pool(&config.database)
        .await
        .map_err(|e| anyhow::anyhow!("database connection failed: {}", e))?;
    db::run_migrations(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("database migration failed: {}", e))?;

    let store = ObjectStore::connect(&config.storage).await;
    if !store.healthy().await {
        warn!("Object store probe failed at startup; file operations will degrade until it recovers");
    }

    // Container backend is chosen once from configuration and injected
    // everywhere explicitly.
    let runtime: Arc<dyn ContainerScheduler> = match config.runtime.kind {
        RuntimeKind::Docker => Arc::new(
            DockerScheduler::connect(
                config.runtime.docker_socket.as_deref(),
                config.runtime.pids_limit,
                config.runtime.stop_timeout_secs,
                &config.runtime.pip_index_url,
            )
            .await
            .map_err(|e| anyhow::anyhow!("docker backend unavailable: {}", e))?,
        ),
        RuntimeKind::Kubernetes => Arc::new(
            KubernetesScheduler::connect(
                &config.runtime.kubernetes_namespace,
                &config.runtime.pip_index_url,
            )
            .await
            .map_err(|e| anyhow::anyhow!("kubernetes backend unavailable: {}", e))?,
        ),
    };
    info!("Container runtime connected ({})", runtime.runtime_type());

    let metrics = Arc::new(Metrics::new());
    let template_cache = Arc::new(noxrun::cache::TemplateCache::new(noxrun::cache::DEFAULT_TTL));
    let warm_pool = Arc::new(WarmPool::new(
        config.scheduler.warm_pool_enabled,
        config.scheduler.warm_pool_default_target,
        config.scheduler.warm_pool_targets.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(warm_pool.clone(), config.scheduler.clone()));

    let sessions = Arc::new(SessionManager::new(
        db_pool.clone(),
        runtime.clone(),
        scheduler.clone(),
        store.clone(),
        template_cache.clone(),
        config.clone(),
        metrics.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        db_pool.clone(),
        template_cache.clone(),
        config.clone(),
        metrics.clone(),
    ));

    // Cooperative shutdown: loops watch this channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let lifecycle = Arc::new(LifecycleManager::new(
        db_pool.clone(),
        sessions.clone(),
        engine.clone(),
        runtime.clone(),
        warm_pool.clone(),
        config.clone(),
        metrics.clone(),
    ));
    lifecycle.start(shutdown_rx.clone());

    let reconciler = Arc::new(Reconciler::new(
        db_pool.clone(),
        sessions.clone(),
        engine.clone(),
        runtime.clone(),
        warm_pool.clone(),
        config.clone(),
        metrics.clone(),
    ));
    reconciler.start(shutdown_rx);

    let state = AppState {
        db: db_pool,
        sessions,
        engine,
        runtime,
        store,
        pool: warm_pool,
        template_cache,
        config: config.clone(),
        metrics,
    };
    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", config.server.listen_addr, e))?;

    info!("NOXRUN Backend ready");

    let shutdown_grace = config.server.graceful_shutdown_timeout_secs;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("server error: {}", e))?;

    // Signal the loops and give them a bounded window to finish a tick.
    info!("Shutting down background loops");
    if shutdown_tx.send(true).is_err() {
        error!("All background loops already gone");
    }
    tokio::time::sleep(std::time::Duration::from_secs(shutdown_grace.min(5))).await;
    info!("NOXRUN Backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
