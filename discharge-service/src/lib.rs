pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;
pub mod visitor;

use metrics_exporter_prometheus::PrometheusHandle;
use service_core::axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    login_rate_limit_middleware, metrics_middleware, request_id_middleware,
    security_headers_middleware, LoginRateLimiter,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::services::Discharger;

#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub discharger: Arc<Discharger>,
    pub metrics: Option<PrometheusHandle>,
    pub login_rate_limiter: LoginRateLimiter,
    pub allowed_origins: Vec<String>,
}

pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .discharger
        .store()
        .health_check()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "identity store health check failed");
            AppError::ServiceUnavailable
        })?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "service": state.service_name,
        "sessions": state.discharger.sessions().len(),
    })))
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    // Endpoints that accept passwords are rate limited per client IP.
    let password_routes = Router::new()
        .route(
            "/login/:provider/browser",
            get(handlers::browser_login_page).post(handlers::browser_login),
        )
        .route("/login/:provider/form", post(handlers::legacy_form_login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            login_rate_limit_middleware,
        ));

    let origins = state
        .allowed_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("invalid CORS origin {:?}: {}", o, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/discharge", post(handlers::discharge))
        .route("/login/:provider/signed", get(handlers::signed_login))
        .route("/login/legacy-agent", get(handlers::legacy_agent_login))
        .route("/login-legacy", get(handlers::login_methods))
        .route("/wait", get(handlers::wait))
        .route("/wait-token", get(handlers::wait))
        .merge(password_routes)
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                // The path only; wait ids in query strings stay out of logs.
                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(handlers::discharge::INTERACTION_KINDS_HEADER),
                ]),
        );

    Ok(app)
}
