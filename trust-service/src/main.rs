use service_core::observability::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use trust_service::{
    build_router,
    config::TrustConfig,
    db,
    services::{
        metrics::init_metrics, sweep::spawn_expiry_sweep, Database, MemoryRevocationList,
        RedisService, RevocationList, SystemClock,
    },
    AppState, Stores,
};

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    dotenvy::dotenv().ok();

    // Load configuration - fail fast if invalid
    let config = TrustConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    init_metrics();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting trust service"
    );

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let revocations: Arc<dyn RevocationList> = match &config.redis {
        Some(redis) => Arc::new(RedisService::new(redis).await?),
        None => {
            tracing::warn!("REDIS_URL not set, using in-process revocation list");
            Arc::new(MemoryRevocationList::new())
        }
    };

    let sweep_interval = Duration::from_secs(config.impersonation.sweep_interval_secs);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));

    let state = AppState::new(
        config.clone(),
        Stores::postgres(Database::new(pool)),
        revocations,
        Arc::new(SystemClock),
    );

    let shutdown = CancellationToken::new();
    let sweep = spawn_expiry_sweep(state.impersonation.clone(), sweep_interval, shutdown.clone());

    let app = build_router(state);

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if let Err(e) = sweep.await {
        tracing::error!(error = %e, "Expiry sweep task failed");
    }

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    shutdown.cancel();
}
