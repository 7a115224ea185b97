//! Outbound calls to the `OpenAI`-compatible endpoint.
//!
//! Streaming runs as a three-stage pipeline: the remote SSE body is parsed into chunks,
//! a spawned pump task feeds them through a [`StreamTranslator`], and the translated
//! events travel over a bounded channel to the client's SSE response. When the client
//! goes away the channel closes, the pump task notices and drops the remote response.

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use crate::logging::SharedLogger;
use crate::server::AppState;
use crate::translate::anthropic_types::{ErrorResponse, MessagesResponse, StreamEvent};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse,
};
use crate::translate::response::{openai_to_anthropic, upstream_error_body};
use crate::translate::streaming::StreamTranslator;

use eventsource_stream::Eventsource;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Capacity of the pump-to-client channel, in events.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Cooldown applied after a remote 429 that carries no usable `retry-after`.
pub const DEFAULT_UPSTREAM_COOLDOWN: Duration = Duration::from_secs(60);

/// Outcome of a call that reached the remote endpoint.
pub enum ProxyResult<T> {
    Success(T),
    /// Remote error, translated, with the remote status code.
    Error(ErrorResponse, u16),
}

pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    pub fn from_event(event: &StreamEvent) -> Self {
        let data = serde_json::to_string(event).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize {} event: {e}", event.event_name());
            "{}".to_string()
        });
        Self {
            event: event.event_name().to_string(),
            data,
        }
    }
}

/// HTTP client for the remote endpoint.
///
/// `timeout_secs` bounds connecting and each read, not the whole exchange, so a long
/// stream that keeps producing chunks is never cut off.
pub fn build_client(upstream: &UpstreamConfig) -> Result<reqwest::Client> {
    let timeout = Duration::from_secs(upstream.timeout_secs);
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()?)
}

/// Forward a translated request and wait for the complete response.
pub async fn proxy_non_streaming(
    state: &AppState,
    openai_req: &ChatCompletionRequest,
    original_model: &str,
) -> Result<ProxyResult<MessagesResponse>> {
    let response = send(state, openai_req).await?;
    let status = response.status().as_u16();

    if status >= 400 {
        return Ok(ProxyResult::Error(
            upstream_failure(state, response).await,
            status,
        ));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ProxyError::provider(format!("Failed to read response body: {e}")))?;

    state.logger.debug(
        "proxy",
        format!("Response status={status} body_len={}", body.len()),
    );

    let openai_resp: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
        ProxyError::provider(format!(
            "Failed to parse upstream response: {e}. Body: {}",
            truncate(&body, 300)
        ))
    })?;

    let anthropic_resp = openai_to_anthropic(&openai_resp, original_model);

    state.logger.info(
        "proxy",
        format!(
            "Completed: in={} out={} tokens stop={}",
            anthropic_resp.usage.input_tokens,
            anthropic_resp.usage.output_tokens,
            anthropic_resp.stop_reason.as_deref().unwrap_or("-"),
        ),
    );

    Ok(ProxyResult::Success(anthropic_resp))
}

/// Forward a translated streaming request. On success the remote body is already being
/// pumped into the returned stream.
pub async fn proxy_streaming(
    state: &AppState,
    openai_req: &ChatCompletionRequest,
    original_model: &str,
    input_tokens: u64,
) -> Result<ProxyResult<SseStream>> {
    let response = send(state, openai_req).await?;
    let status = response.status().as_u16();

    if status >= 400 {
        return Ok(ProxyResult::Error(
            upstream_failure(state, response).await,
            status,
        ));
    }

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let translator = StreamTranslator::new(original_model, input_tokens);
    let chunks = upstream_chunks(response, state.logger.clone());
    tokio::spawn(pump(chunks, translator, tx, state.logger.clone()));

    Ok(ProxyResult::Success(Box::pin(ReceiverStream::new(rx))))
}

/// A complete SSE sequence for an answer produced without the remote endpoint.
pub fn canned_stream(events: Vec<StreamEvent>) -> SseStream {
    let events: Vec<SseEvent> = events.iter().map(SseEvent::from_event).collect();
    Box::pin(futures::stream::iter(events))
}

async fn send(state: &AppState, openai_req: &ChatCompletionRequest) -> Result<reqwest::Response> {
    let url = state.config.chat_completions_url();

    state.logger.info(
        "proxy",
        format!(
            "POST {url} model={} messages={} stream={}",
            openai_req.model,
            openai_req.messages.len(),
            openai_req.stream.unwrap_or(false)
        ),
    );

    state
        .client
        .post(&url)
        .bearer_auth(&state.api_key)
        .header("Content-Type", "application/json")
        .json(openai_req)
        .send()
        .await
        .map_err(|e| ProxyError::provider(format!("Upstream unreachable: {e}")))
}

/// Read and translate a remote error body. A remote 429 also puts the limiter into
/// cooldown so queued requests stop hammering the endpoint.
async fn upstream_failure(state: &AppState, response: reqwest::Response) -> ErrorResponse {
    let status = response.status().as_u16();

    if status == 429 {
        let cooldown = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(DEFAULT_UPSTREAM_COOLDOWN, Duration::from_secs);
        state.limiter.block_for(cooldown);
        state.logger.warn(
            "limiter",
            format!("Upstream rate limited, cooling down for {}s", cooldown.as_secs()),
        );
    }

    let body = response.text().await.unwrap_or_default();
    state.logger.warn(
        "proxy",
        format!("Upstream error status={status}: {}", truncate(&body, 300)),
    );

    upstream_error_body(status, truncate(&body, 2000))
}

/// One item read from the remote SSE body.
#[derive(Debug)]
enum UpstreamItem {
    Chunk(Box<ChatCompletionChunk>),
    Done,
    Failed(String),
}

fn upstream_chunks(
    response: reqwest::Response,
    logger: SharedLogger,
) -> impl Stream<Item = UpstreamItem> + Send + 'static {
    async_stream::stream! {
        let mut events = response.bytes_stream().eventsource();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield UpstreamItem::Failed(format!("Upstream stream error: {e}"));
                    break;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                yield UpstreamItem::Done;
                break;
            }

            // An error object mid-stream ends the response.
            if let Ok(err) = serde_json::from_str::<ChatErrorResponse>(data) {
                yield UpstreamItem::Failed(err.error.message);
                break;
            }

            match serde_json::from_str::<ChatCompletionChunk>(data) {
                Ok(chunk) => {
                    yield UpstreamItem::Chunk(Box::new(chunk));
                }
                Err(e) => logger.debug("stream", format!("Skipping unparseable chunk: {e}")),
            }
        }
    }
}

async fn pump(
    chunks: impl Stream<Item = UpstreamItem> + Send + 'static,
    mut translator: StreamTranslator,
    tx: mpsc::Sender<SseEvent>,
    logger: SharedLogger,
) {
    tokio::pin!(chunks);

    loop {
        let item = tokio::select! {
            () = tx.closed() => {
                logger.info("stream", "Client disconnected, dropping upstream response");
                return;
            }
            item = chunks.next() => item,
        };

        let events = match item {
            Some(UpstreamItem::Chunk(chunk)) => translator.process_chunk(&chunk),
            Some(UpstreamItem::Failed(message)) => {
                logger.error("stream", format!("Stream aborted: {message}"));
                translator.fail(&message)
            }
            Some(UpstreamItem::Done) | None => translator.finish(),
        };

        for event in &events {
            if tx.send(SseEvent::from_event(event)).await.is_err() {
                logger.info("stream", "Client disconnected, dropping upstream response");
                return;
            }
        }

        if translator.is_finished() {
            break;
        }
    }

    logger.info(
        "stream",
        format!("Stream completed: out={} tokens", translator.output_tokens()),
    );
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
