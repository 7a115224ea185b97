use crate::classifier::Classifier;
use crate::config::GatewayConfig;
use crate::error::ProxyError;
use crate::logging::{LogLevel, SharedLogger};
use crate::proxy::{self, ProxyResult, SseStream};
use crate::rate_limit::RateLimiter;
use crate::translate::anthropic_types::{
    CountTokensRequest, CountTokensResponse, ErrorResponse, MessagesRequest,
};
use crate::translate::request::anthropic_to_openai;
use crate::translate::tokens::estimate_input_tokens;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Everything a request handler needs, built once at startup.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
    pub api_key: String,
    pub limiter: Arc<RateLimiter>,
    pub classifier: Classifier,
}

impl AppState {
    /// Wire the limiter and classifier from `config`.
    pub fn new(
        config: GatewayConfig,
        client: reqwest::Client,
        logger: SharedLogger,
        api_key: String,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.limits.rate_limit,
            config.rate_window(),
        ));
        let classifier = Classifier::from_config(&config);
        Self {
            config: Arc::new(config),
            client,
            logger,
            api_key,
            limiter,
            classifier,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .warn("server", format!("Failed to parse request: {e}"));
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let is_streaming = req.stream.unwrap_or(false);

    state.logger.info(
        "server",
        format!(
            "Request: model={} streaming={} messages={}",
            req.model,
            is_streaming,
            req.messages.len()
        ),
    );

    if let Some(canned) = state.classifier.classify(&req) {
        state.logger.log_with_context(
            LogLevel::Info,
            "classifier",
            format!("Answered locally: {}", canned.rule.name()),
            serde_json::json!({ "model": req.model, "streaming": is_streaming }),
        );
        return if is_streaming {
            sse_response(proxy::canned_stream(canned.to_stream_events(&req.model)))
        } else {
            Json(canned.to_response(&req.model)).into_response()
        };
    }

    if let Err(e) = state.limiter.acquire(state.config.limits.policy).await {
        return error_response(&state, &e);
    }

    let openai_req = match anthropic_to_openai(&req, &state.config) {
        Ok(r) => r,
        Err(e) => return error_response(&state, &e),
    };

    if is_streaming {
        let input_tokens =
            estimate_input_tokens(&req.messages, req.system.as_ref(), req.tools.as_deref());
        match proxy::proxy_streaming(&state, &openai_req, &req.model, input_tokens).await {
            Ok(ProxyResult::Success(stream)) => sse_response(stream),
            Ok(ProxyResult::Error(err, status)) => upstream_error_response(err, status),
            Err(e) => error_response(&state, &e),
        }
    } else {
        match proxy::proxy_non_streaming(&state, &openai_req, &req.model).await {
            Ok(ProxyResult::Success(resp)) => Json(resp).into_response(),
            Ok(ProxyResult::Error(err, status)) => upstream_error_response(err, status),
            Err(e) => error_response(&state, &e),
        }
    }
}

async fn handle_count_tokens(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req: CountTokensRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let input_tokens =
        estimate_input_tokens(&req.messages, req.system.as_ref(), req.tools.as_deref());
    state.logger.debug(
        "server",
        format!("count_tokens: model={} estimate={input_tokens}", req.model),
    );

    Json(CountTokensResponse { input_tokens }).into_response()
}

fn sse_response(stream: SseStream) -> Response {
    let events = stream.map(|e| -> Result<Event, Infallible> {
        Ok(Event::default().event(e.event).data(e.data))
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    response
        .headers_mut()
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

fn upstream_error_response(err: ErrorResponse, status: u16) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(err)).into_response()
}

/// Map a gateway error onto the Anthropic error shape.
fn error_response(state: &AppState, err: &ProxyError) -> Response {
    match err {
        ProxyError::RateLimited { retry_after } => {
            let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
            state
                .logger
                .warn("limiter", format!("Rejected request, retry in {secs}s"));
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse::rate_limited(err.to_string())),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            response
        }
        e if e.is_client_error() => {
            state.logger.warn("server", format!("Rejected request: {e}"));
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::invalid_request(e.to_string())),
            )
                .into_response()
        }
        ProxyError::Provider { .. } | ProxyError::Http(_) => {
            state.logger.error("proxy", err.to_string());
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::api_error(err.to_string())),
            )
                .into_response()
        }
        other => {
            state.logger.error("server", other.to_string());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::api_error(other.to_string())),
            )
                .into_response()
        }
    }
}

async fn handle_root(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "provider": state.config.upstream.name,
        "model": state.config.upstream.model,
    }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut names: Vec<&String> = state.config.models.keys().collect();
    names.sort();

    let mut models: Vec<serde_json::Value> = names
        .into_iter()
        .map(|name| {
            serde_json::json!({
                "id": name,
                "object": "model",
                "owned_by": state.config.upstream.name,
                "target": state.config.models[name],
            })
        })
        .collect();
    models.push(serde_json::json!({
        "id": state.config.upstream.model,
        "object": "model",
        "owned_by": state.config.upstream.name,
    }));

    Json(serde_json::json!({ "data": models, "object": "list" }))
}
