//! Query endpoint

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::server::middleware::{error_response, inference_error_response, RequestContext};
use crate::server::state::ServerState;

/// Create the query router
pub fn create_router() -> Router<ServerState> {
    Router::new().route("/query", get(query_get).post(query_post))
}

/// Prompt supplied as `?prompt=...`
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub prompt: Option<String>,
}

/// Prompt supplied as a JSON body
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: String,
    pub metadata: QueryMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryMetadata {
    /// Seconds since the request arrived
    pub processing_time: f64,
    /// Seconds spent in the model process
    pub model_time: f64,
    pub request_id: String,
}

async fn query_get(
    State(state): State<ServerState>,
    Extension(ctx): Extension<RequestContext>,
    params: Result<Query<QueryParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return invalid_query(rejection),
    };
    match params.prompt {
        Some(prompt) => run_query(&state, &ctx, prompt).await,
        None => missing_prompt(),
    }
}

/// The JSON body wins over the query parameter when both are present.
async fn query_post(
    State(state): State<ServerState>,
    Extension(ctx): Extension<RequestContext>,
    params: Result<Query<QueryParams>, QueryRejection>,
    body: Bytes,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return invalid_query(rejection),
    };

    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<QueryRequest>(&body) {
            Ok(request) => request.prompt,
            Err(e) => {
                return error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "Invalid request",
                    format!("request body is not valid JSON: {}", e),
                )
            }
        }
    };

    match from_body.or(params.prompt) {
        Some(prompt) => run_query(&state, &ctx, prompt).await,
        None => missing_prompt(),
    }
}

fn invalid_query(rejection: QueryRejection) -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Invalid request",
        rejection.body_text(),
    )
}

fn missing_prompt() -> Response {
    error_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "Invalid request",
        "a non-empty 'prompt' is required",
    )
}

async fn run_query(state: &ServerState, ctx: &RequestContext, prompt: String) -> Response {
    if prompt.trim().is_empty() {
        return missing_prompt();
    }

    let _active = state.metrics.begin_query();
    let deadline = ctx.inference_deadline(state.config.inference_timeout());

    info!(request_id = %ctx.request_id, prompt_len = prompt.len(), "Dispatching query");

    match state.session.query(&prompt, deadline).await {
        Ok(result) => {
            let body = QueryResponse {
                response: result.text,
                metadata: QueryMetadata {
                    processing_time: ctx.elapsed().as_secs_f64(),
                    model_time: result.model_duration.as_secs_f64(),
                    request_id: ctx.request_id.clone(),
                },
            };
            Json(body).into_response()
        }
        Err(e) => {
            state.metrics.record_failure(&e);
            if e.is_timeout() {
                warn!(request_id = %ctx.request_id, error = %e, "Query timed out");
            } else {
                error!(request_id = %ctx.request_id, kind = e.kind(), error = %e, "Query failed");
            }
            inference_error_response(&e)
        }
    }
}
