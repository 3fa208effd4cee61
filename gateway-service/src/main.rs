use gateway_service::{
    build_router,
    config::{Environment, GatewayConfig},
    services::{
        AuditSink, MembershipProvider, MemoryRevocationStore, RedisRevocationStore,
        RevocationStore, StaticDirectory, TracingAuditSink,
    },
    AppState,
};
use gateway_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), gateway_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = GatewayConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    if config.environment == Environment::Dev {
        gateway_core::error::expose_error_details(true);
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting request-security gateway"
    );

    // Store backend is an explicit startup decision. The in-memory
    // fallback keeps a single instance working without Redis, but its
    // entries are invisible to sibling instances.
    let store: Arc<dyn RevocationStore> = match &config.redis.url {
        Some(url) => {
            let store = RedisRevocationStore::connect(url)
                .await
                .map_err(gateway_core::error::AppError::InternalError)?;
            tracing::info!("Revocation store backend: redis");
            Arc::new(store)
        }
        None => {
            tracing::warn!(
                "REDIS_URL not set; using per-process in-memory security store"
            );
            let store = MemoryRevocationStore::new();
            store.spawn_sweeper(Duration::from_secs(60));
            Arc::new(store)
        }
    };

    // Stand-in directory; a deployment replaces this with its user
    // service client implementing MembershipProvider.
    let directory: Arc<dyn MembershipProvider> = Arc::new(StaticDirectory::new());
    let sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let state = AppState::new(config.clone(), store, directory, sink);
    state
        .audit
        .clone()
        .spawn_flusher(Duration::from_secs(config.audit.flush_interval_seconds));

    // Business routes mount behind the chain here; the bare gateway only
    // exposes its own session endpoints.
    let app = build_router(state.clone(), axum::Router::new());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain whatever the flusher has not picked up yet.
    state.audit.flush().await;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
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
}
