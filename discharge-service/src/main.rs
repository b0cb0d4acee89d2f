use discharge_service::{
    build_router,
    config::DischargeConfig,
    db,
    services::{
        Bakery, Discharger, IdentityStore, MemoryIdentityStore, PgIdentityStore, ProviderRegistry,
        SessionTracker,
    },
    AppState,
};
use service_core::error::AppError;
use service_core::middleware::create_login_rate_limiter;
use service_core::observability::{init_tracing, install_prometheus_recorder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on bad configuration
    let config = DischargeConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;
    let metrics = install_prometheus_recorder()?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        location = %config.location,
        "Starting discharge service"
    );

    let store: Arc<dyn IdentityStore> = match &config.database {
        Some(database) => {
            let pool = db::create_pool(database)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            tracing::info!("Identity store: postgres");
            Arc::new(PgIdentityStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, identities are kept in memory");
            Arc::new(MemoryIdentityStore::new())
        }
    };

    let http = reqwest::Client::builder()
        .user_agent(concat!("discharge-service/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("failed to build HTTP client: {}", e)))?;
    let registry = ProviderRegistry::from_config(&config.providers, http)?;

    let bakery = Bakery::new(
        config.location.clone(),
        config.shared_key()?,
        Duration::from_secs(config.sessions.discharge_expiry_seconds),
    );

    let sessions = Arc::new(SessionTracker::new(Duration::from_secs(
        config.sessions.session_ttl_seconds,
    )));
    sessions.clone().spawn_sweeper(Duration::from_secs(30));

    let discharger = Discharger::new(
        config.location.clone(),
        registry,
        store,
        sessions,
        Arc::new(bakery),
        Duration::from_secs(config.sessions.wait_timeout_seconds),
    );

    let login_rate_limiter = create_login_rate_limiter(
        config.rate_limit.login_attempts,
        config.rate_limit.login_window_seconds,
    );

    let state = AppState {
        service_name: config.service_name.clone(),
        discharger: Arc::new(discharger),
        metrics: Some(metrics),
        login_rate_limiter,
        allowed_origins: config.allowed_origins.clone(),
    };
    let app = build_router(state)?;

    let addr = config.common.socket_addr()?;

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
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
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
