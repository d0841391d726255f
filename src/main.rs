//! Router Launcher
//!
//! HTTP control surface for launching local inference runtimes and the chat
//! router. Optionally launches the configured plan at startup and tears it
//! down on exit.

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use router_launcher::api;
use router_launcher::config::Config;
use router_launcher::orchestrator::PlanConfig;
use router_launcher::state::AppState;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// How long a cancelled launch gets to settle before teardown on exit
const STOP_WAIT: Duration = Duration::from_secs(30);

/// Request ID middleware - adds unique ID to each request for tracing
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    let response = next.run(request).instrument(span).await;

    info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status().as_u16(),
        duration_ms = start.elapsed().as_millis(),
        "Request completed"
    );

    response
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    info!("Configuration loaded: {:?}", config);

    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;
    let launch_on_start = config.launch.launch_on_start;
    let teardown_on_exit = config.launch.teardown_on_exit;
    let plan_path = config.launch.plan_path.clone();
    let defaults = config.launch_defaults();

    let state = AppState::new(config).shared();

    if launch_on_start {
        match plan_path {
            Some(path) => {
                let plan = PlanConfig::load(&path)
                    .and_then(|c| c.into_plan(&defaults))
                    .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
                // Outcome is logged by the orchestrator and exposed via /api/launch/status
                api::launch::start_launch(&state, plan).await?;
                info!(plan = %path.display(), "Launching configured plan in the background");
            }
            None => warn!("LAUNCH_ON_START is set but LAUNCH_PLAN is not, skipping launch"),
        }
    }

    let app = Router::new()
        .route("/api/health", get(api::health_check))
        .route("/api/launch", post(api::launch::launch))
        .route("/api/launch/status", get(api::launch::launch_status))
        .route("/api/launch/cancel", post(api::launch::cancel_launch))
        .route("/api/launch/teardown", post(api::launch::teardown))
        // Middleware (order matters - request_id should be first)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    info!("🚀 Launcher running on http://{}", addr);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if teardown_on_exit {
        let report = api::launch::stop_all(&state, STOP_WAIT).await;
        info!(
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            "Runtimes torn down"
        );
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
