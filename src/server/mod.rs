//! HTTP server for the inference gateway
//!
//! Routes:
//! - `GET /` welcome payload
//! - `GET /health` session state and counters
//! - `GET|POST /query` run one prompt through the model session
//!
//! Every route sits behind the [`middleware::InterceptorChain`].

use anyhow::Result;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod middleware;
pub mod routes;
pub mod state;

use middleware::InterceptorChain;
use state::ServerState;

/// Create the main application router
pub fn create_app(state: ServerState) -> Router {
    let chain = InterceptorChain::for_server(&state.config, state.metrics.clone());

    let app = Router::new()
        .route("/", get(welcome))
        .route("/health", get(health_check))
        .merge(routes::query::create_router())
        .with_state(state);

    chain.apply(app).layer(TraceLayer::new_for_http())
}

async fn welcome() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Welcome to the llmgate inference gateway",
        "service": "llmgate",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Health check endpoint
async fn health_check(
    axum::extract::State(state): axum::extract::State<ServerState>,
) -> impl IntoResponse {
    let session_state = state.session.state();
    let status = if session_state.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "healthy" } else { "unavailable" },
            "service": "llmgate",
            "version": env!("CARGO_PKG_VERSION"),
            "session": session_state.as_str(),
            "metrics": state.get_metrics(),
        })),
    )
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn start_server<F>(addr: SocketAddr, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Starting llmgate server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped accepting connections");
    Ok(())
}
