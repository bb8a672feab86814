//! Request pipeline: an ordered chain of interceptors wrapped around the routes.
//!
//! Every interceptor implements [`RequestInterceptor::wrap`]. The chain
//! applies them so that the first stage is the outermost one. The default
//! chain is:
//!
//! 1. [`CorrelationStage`] assigns the request ID, creates the
//!    [`RequestContext`], logs entry and exit and stamps the response headers.
//! 2. [`DeadlineStage`] cancels everything downstream when the request
//!    deadline passes and answers 504.
//! 3. [`CorsStage`] when CORS is enabled.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tracing::{error, info, warn};

use crate::config::{CorsConfig, ServerConfig};
use crate::inference::InferenceError;
use crate::server::state::Metrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PROCESS_TIME_HEADER: &str = "x-process-time";

/// Per-request record created at entry and dropped with the response
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Wall-clock arrival time, for logs
    pub received_at: DateTime<Utc>,
    pub arrived_at: Instant,
    /// Absolute end of the request budget
    pub deadline: Instant,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, budget: Duration) -> Self {
        let arrived_at = Instant::now();
        Self {
            request_id: request_id.into(),
            received_at: Utc::now(),
            arrived_at,
            deadline: arrived_at + budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.arrived_at.elapsed()
    }

    /// Deadline for the model session: `budget` from arrival, never past the
    /// request deadline.
    pub fn inference_deadline(&self, budget: Duration) -> Instant {
        (self.arrived_at + budget).min(self.deadline)
    }
}

/// Correlation IDs from the arrival time in nanoseconds, strictly increasing
/// within the process even when the clock stalls or steps back.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |last| {
                Some(now.max(last + 1))
            }) {
            Ok(previous) | Err(previous) => now.max(previous + 1),
        }
    }
}

/// Standard error response format
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: String,
}

/// Build a JSON error response
pub fn error_response(
    status: StatusCode,
    error: impl Into<String>,
    details: impl Into<String>,
) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            details: details.into(),
        }),
    )
        .into_response()
}

/// Map an inference failure to its HTTP response: 504 for timeouts, 500 otherwise
pub fn inference_error_response(err: &InferenceError) -> Response {
    match err {
        InferenceError::Timeout { elapsed } => error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "Request timeout",
            format!(
                "inference did not complete within {:.2}s",
                elapsed.as_secs_f64()
            ),
        ),
        InferenceError::ExecutableMissing { path } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Model executable not found",
            path.display().to_string(),
        ),
        InferenceError::ModelArtifactMissing { path } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Model artifact not found",
            path.display().to_string(),
        ),
        InferenceError::SystemPromptUnavailable { message, .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "System prompt unavailable",
            message.clone(),
        ),
        InferenceError::ProcessFailed { stderr_text, .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Model process failed",
            stderr_text.clone(),
        ),
        InferenceError::Unexpected { message } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            message.clone(),
        ),
    }
}

/// A composable request stage
pub trait RequestInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wrap every route of `router` with this stage
    fn wrap(&self, router: Router) -> Router;
}

/// Ordered list of interceptors; the first one sees the request first
#[derive(Default)]
pub struct InterceptorChain {
    stages: Vec<Box<dyn RequestInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard pipeline for a server configuration
    pub fn for_server(config: &ServerConfig, metrics: Arc<Metrics>) -> Self {
        let mut chain = Self::new()
            .with(CorrelationStage::new(config.request_timeout()))
            .with(DeadlineStage::new(config.request_timeout(), metrics));
        if config.cors.enabled {
            chain = chain.with(CorsStage::new(config.cors.clone()));
        }
        chain
    }

    pub fn with(mut self, stage: impl RequestInterceptor + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, router: Router) -> Router {
        // Layers added last run first, so wrap innermost to outermost
        self.stages
            .iter()
            .rev()
            .fold(router, |router, stage| stage.wrap(router))
    }
}

/// Correlation ID assignment, timing and request logging
#[derive(Clone)]
pub struct CorrelationStage {
    ids: Arc<RequestIdGenerator>,
    request_timeout: Duration,
}

impl CorrelationStage {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            ids: Arc::new(RequestIdGenerator::new()),
            request_timeout,
        }
    }
}

impl RequestInterceptor for CorrelationStage {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn wrap(&self, router: Router) -> Router {
        router
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(middleware::from_fn_with_state(self.clone(), correlate))
    }
}

async fn correlate(
    State(stage): State<CorrelationStage>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = RequestContext::new(stage.ids.next_id().to_string(), stage.request_timeout);
    let method = request.method().clone();
    let uri = request.uri().clone();

    info!(
        request_id = %ctx.request_id,
        %method,
        %uri,
        received_at = %ctx.received_at.to_rfc3339(),
        "Request received"
    );

    request.extensions_mut().insert(ctx.clone());
    let mut response = next.run(request).await;

    let elapsed = ctx.elapsed();
    let status = response.status();
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    if status.is_client_error() || status.is_server_error() {
        warn!(
            request_id = %ctx.request_id,
            %method,
            %uri,
            %status,
            elapsed_ms,
            "Request failed"
        );
    } else {
        info!(
            request_id = %ctx.request_id,
            %method,
            %uri,
            %status,
            elapsed_ms,
            "Request completed"
        );
    }

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
        headers.insert(HeaderName::from_static(PROCESS_TIME_HEADER), value);
    }

    response
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    };
    error!(panic = %message, "Handler panicked");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error",
        message,
    )
}

/// Hard wall-clock budget for everything downstream
#[derive(Clone)]
pub struct DeadlineStage {
    budget: Duration,
    metrics: Arc<Metrics>,
}

impl DeadlineStage {
    pub fn new(budget: Duration, metrics: Arc<Metrics>) -> Self {
        Self { budget, metrics }
    }
}

impl RequestInterceptor for DeadlineStage {
    fn name(&self) -> &'static str {
        "deadline"
    }

    fn wrap(&self, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self.clone(), enforce_deadline))
    }
}

async fn enforce_deadline(
    State(stage): State<DeadlineStage>,
    request: Request,
    next: Next,
) -> Response {
    let (request_id, deadline) = match request.extensions().get::<RequestContext>() {
        Some(ctx) => (ctx.request_id.clone(), ctx.deadline),
        None => ("-".to_string(), Instant::now() + stage.budget),
    };

    // Dropping the downstream future cancels the query, which releases the
    // model gate and kills any child process still running.
    match tokio::time::timeout_at(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            stage.metrics.record_timeout();
            warn!(
                request_id = %request_id,
                budget_secs = stage.budget.as_secs_f64(),
                "Request deadline expired, cancelled in-flight work"
            );
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Request timeout",
                format!(
                    "request exceeded the {:.2}s budget",
                    stage.budget.as_secs_f64()
                ),
            )
        }
    }
}

/// CORS headers from configuration
pub struct CorsStage {
    config: CorsConfig,
}

impl CorsStage {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }
}

impl RequestInterceptor for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn wrap(&self, router: Router) -> Router {
        router.layer(cors_layer(&self.config))
    }
}

/// CORS middleware configuration
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE])
        .expose_headers([
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(PROCESS_TIME_HEADER),
        ]);

    if config.allowed_origins.is_empty() || config.allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(AnyOrigin);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    cors.allow_origin(origins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_strictly_increase() {
        let ids = RequestIdGenerator::new();
        let mut previous = ids.next_id();
        for _ in 0..1000 {
            let next = ids.next_id();
            assert!(next > previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn test_inference_deadline_never_exceeds_request_deadline() {
        let ctx = RequestContext::new("1", Duration::from_secs(30));
        assert_eq!(
            ctx.inference_deadline(Duration::from_secs(25)),
            ctx.arrived_at + Duration::from_secs(25)
        );
        assert_eq!(ctx.inference_deadline(Duration::from_secs(60)), ctx.deadline);
    }

    #[test]
    fn test_timeout_maps_to_504() {
        let response = inference_error_response(&InferenceError::Timeout {
            elapsed: Duration::from_secs(25),
        });
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = inference_error_response(&InferenceError::ProcessFailed {
            stderr_text: "bad model file".into(),
            exit_code: Some(1),
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_chain_order() {
        let metrics = Arc::new(Metrics::default());
        let config = ServerConfig::default();
        let chain = InterceptorChain::for_server(&config, metrics.clone());
        assert_eq!(chain.names(), vec!["correlation", "deadline"]);

        let mut config = ServerConfig::default();
        config.cors.enabled = true;
        let chain = InterceptorChain::for_server(&config, metrics);
        assert_eq!(chain.names(), vec!["correlation", "deadline", "cors"]);
    }
}
