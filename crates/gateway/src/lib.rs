//! HTTP gateway for Turnstile.
//!
//! Exposes the chat endpoint, session management and a health check.
//! Built on Axum; every request is handed to the shared
//! [`Orchestrator`](turnstile_orchestrator::Orchestrator).

pub mod api;
pub mod error;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    response::Json,
    routing::get,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use turnstile_config::{AppConfig, GatewayConfig};
use turnstile_orchestrator::Orchestrator;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub orchestrator: Orchestrator,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
///
/// Layers applied:
/// - Request body size limit
/// - CORS (permissive unless disabled in config)
/// - HTTP trace logging
pub fn build_router(state: SharedState, config: &GatewayConfig) -> Router {
    let router = Router::new()
        .route("/", get(welcome_handler))
        .route("/health", get(health_handler))
        .nest("/api", api::api_router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes));

    let router = if config.cors_permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };
    router.layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// The store and provider are built once from `config` and shared by every
/// request. Returns after Ctrl-C once in-flight requests have drained.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    config.require_serving()?;

    let store_url = config.store_url.as_deref().unwrap_or_default();
    let store = turnstile_store::connect(store_url).await?;
    let client = turnstile_providers::build_client(&config)?;
    info!(
        store = store.name(),
        provider = client.provider().name(),
        model = %config.generation.default_model,
        "Backends ready"
    );

    let orchestrator = Orchestrator::new(store, client, &config);
    let app = build_router(Arc::new(GatewayState::new(orchestrator)), &config.gateway);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Turnstile listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, draining connections");
}

// --- Handlers ---

#[derive(Serialize)]
struct WelcomeResponse {
    message: &'static str,
    version: &'static str,
}

async fn welcome_handler() -> Json<WelcomeResponse> {
    Json(WelcomeResponse {
        message: "Welcome to Turnstile",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    store: bool,
    provider: bool,
    uptime_secs: u64,
}

/// Liveness always answers 200; backend reachability is reported in the body.
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let report = state.orchestrator.health().await;
    Json(HealthResponse {
        status: if report.store && report.provider {
            "ok"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        store: report.store,
        provider: report.provider,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
