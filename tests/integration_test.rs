//! End-to-end tests: the gateway router in front of a mock `OpenAI`-compatible upstream,
//! both bound to ephemeral ports on 127.0.0.1.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use kimigate::config::SkipConfig;
use kimigate::proxy::build_client;
use kimigate::{build_router, AppState, GatewayConfig, SharedLogger};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const API_KEY: &str = "test-key";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Answer with the last user message.
    Echo,
    /// Always 429 with an `OpenAI` error body.
    RateLimited,
    /// Stream chunks forever.
    Endless,
    /// Stream a fixed number of chunks with a pause before each, then finish.
    Slow { chunks: usize, gap_ms: u64 },
}

struct Upstream {
    mode: Mode,
    hits: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
    stream_dropped: Arc<AtomicBool>,
}

impl Upstream {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_body(&self) -> Value {
        self.bodies.lock().unwrap().last().cloned().unwrap()
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

async fn chat_completions(
    State(up): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    up.hits.fetch_add(1, Ordering::SeqCst);
    up.bodies.lock().unwrap().push(body.clone());

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {API_KEY}"));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "bad key", "type": "authentication_error"}})),
        )
            .into_response();
    }

    match up.mode {
        Mode::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "30")],
            Json(json!({"error": {"message": "Too many requests", "type": "rate_limit_exceeded"}})),
        )
            .into_response(),
        Mode::Echo if body["stream"] == json!(true) => echo_stream(&last_user_text(&body)),
        Mode::Echo => Json(json!({
            "id": "chatcmpl-echo",
            "object": "chat.completion",
            "created": 0,
            "model": body["model"],
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": last_user_text(&body)},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18}
        }))
        .into_response(),
        Mode::Endless => endless_stream(up.stream_dropped.clone()),
        Mode::Slow { chunks, gap_ms } => slow_stream(chunks, gap_ms),
    }
}

fn last_user_text(body: &Value) -> String {
    body["messages"]
        .as_array()
        .and_then(|m| m.iter().rev().find(|m| m["role"] == "user"))
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn chunk_json(content: &str, finish: Option<&str>) -> String {
    json!({
        "id": "chatcmpl-stream",
        "object": "chat.completion.chunk",
        "created": 0,
        "model": "moonshotai/kimi-k2.5",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": finish}]
    })
    .to_string()
}

fn echo_stream(text: &str) -> Response {
    let mid = text.char_indices().nth(text.chars().count() / 2).map_or(0, |(i, _)| i);
    let frames = [
        chunk_json(&text[..mid], None),
        chunk_json(&text[mid..], None),
        chunk_json("", Some("stop")),
        json!({
            "id": "chatcmpl-stream",
            "choices": [],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18}
        })
        .to_string(),
        "[DONE]".to_string(),
    ];
    let body: String = frames.iter().map(|f| format!("data: {f}\n\n")).collect();

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

fn endless_stream(dropped: Arc<AtomicBool>) -> Response {
    let guard = SetOnDrop(dropped);
    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            yield Ok::<_, Infallible>(Bytes::from(format!("data: {}\n\n", chunk_json("tick ", None))));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

fn slow_stream(chunks: usize, gap_ms: u64) -> Response {
    let stream = async_stream::stream! {
        for _ in 0..chunks {
            tokio::time::sleep(Duration::from_millis(gap_ms)).await;
            yield Ok::<_, Infallible>(Bytes::from(format!("data: {}\n\n", chunk_json("tick ", None))));
        }
        yield Ok(Bytes::from(format!("data: {}\n\n", chunk_json("", Some("stop")))));
        yield Ok(Bytes::from("data: [DONE]\n\n"));
    };

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_upstream(mode: Mode) -> (SocketAddr, Arc<Upstream>) {
    let upstream = Arc::new(Upstream {
        mode,
        hits: AtomicUsize::new(0),
        bodies: Mutex::new(Vec::new()),
        stream_dropped: Arc::new(AtomicBool::new(false)),
    });
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(upstream.clone());
    (serve(app).await, upstream)
}

struct Gateway {
    addr: SocketAddr,
    state: Arc<AppState>,
    _log_dir: tempfile::TempDir,
}

impl Gateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn config_for(upstream: SocketAddr) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.upstream.base_url = format!("http://{upstream}/v1");
    config
}

async fn spawn_gateway(config: GatewayConfig) -> Gateway {
    let log_dir = tempfile::tempdir().unwrap();
    let logger = SharedLogger::new(log_dir.path().join("kimigate.log")).unwrap();
    let client = build_client(&config.upstream).unwrap();
    let state = Arc::new(AppState::new(config, client, logger, API_KEY.to_string()));
    let addr = serve(build_router(state.clone())).await;
    Gateway {
        addr,
        state,
        _log_dir: log_dir,
    }
}

fn message_request(text: &str, stream: bool) -> Value {
    json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 256,
        "stream": stream,
        "messages": [{"role": "user", "content": text}]
    })
}

async fn post_messages(gateway: &Gateway, body: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(gateway.url("/v1/messages"))
        .json(body)
        .send()
        .await
        .unwrap()
}

/// `(event name, data)` pairs from an SSE body.
fn parse_sse(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|frame| {
            let mut event = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(e) = line.strip_prefix("event:") {
                    event = Some(e.trim().to_string());
                } else if let Some(d) = line.strip_prefix("data:") {
                    data = serde_json::from_str(d.trim()).ok();
                }
            }
            Some((event?, data?))
        })
        .collect()
}

fn text_deltas(events: &[(String, Value)]) -> String {
    events
        .iter()
        .filter(|(name, data)| name == "content_block_delta" && data["delta"]["type"] == "text_delta")
        .filter_map(|(_, data)| data["delta"]["text"].as_str())
        .collect()
}

#[tokio::test]
async fn test_short_circuit_skips_upstream_and_limiter() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Echo).await;
    let gateway = spawn_gateway(config_for(upstream_addr)).await;

    let mut quota = message_request("check quota", false);
    quota["max_tokens"] = json!(1);
    let resp = post_messages(&gateway, &quota).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"][0]["text"], "Quota check passed.");
    assert_eq!(body["model"], "claude-sonnet-4-20250514");

    let title = message_request("Please write a 5-10 word title for this conversation", true);
    let resp = post_messages(&gateway, &title).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let events = parse_sse(&resp.text().await.unwrap());
    assert_eq!(text_deltas(&events), "Conversation");
    assert_eq!(events.last().map(|(n, _)| n.as_str()), Some("message_stop"));

    assert_eq!(upstream.hits(), 0);
    assert_eq!(gateway.state.limiter.in_window(), 0);

    let answered: Vec<String> = gateway
        .state
        .logger
        .recent(50)
        .into_iter()
        .filter(|e| e.component == "classifier")
        .map(|e| e.message)
        .collect();
    assert!(answered.iter().any(|m| m.ends_with("quota_check")), "{answered:?}");
    assert!(answered.iter().any(|m| m.ends_with("title_generation")), "{answered:?}");
}

#[tokio::test]
async fn test_non_streaming_round_trip() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Echo).await;
    let gateway = spawn_gateway(config_for(upstream_addr)).await;

    let resp = post_messages(&gateway, &message_request("hello there", false)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "hello there");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 11);
    assert_eq!(body["usage"]["output_tokens"], 7);

    let sent = upstream.last_body();
    assert_eq!(sent["model"], "moonshotai/kimi-k2.5");
    assert_eq!(sent["max_tokens"], 256);
    assert_eq!(sent["temperature"], 1.0);
    assert_eq!(sent["chat_template_kwargs"]["thinking"], true);

    assert_eq!(upstream.hits(), 1);
    assert_eq!(gateway.state.limiter.in_window(), 1);
}

#[tokio::test]
async fn test_streaming_preserves_order() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Echo).await;
    let gateway = spawn_gateway(config_for(upstream_addr)).await;

    let resp = post_messages(&gateway, &message_request("streaming works", true)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let events = parse_sse(&resp.text().await.unwrap());
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();

    assert_eq!(names.first(), Some(&"message_start"));
    assert_eq!(text_deltas(&events), "streaming works");
    assert_eq!(names.iter().filter(|n| **n == "message_stop").count(), 1);
    assert_eq!(names.last(), Some(&"message_stop"));

    let (_, delta) = events
        .iter()
        .find(|(n, _)| n == "message_delta")
        .unwrap();
    assert_eq!(delta["delta"]["stop_reason"], "end_turn");
    assert_eq!(delta["usage"]["output_tokens"], 7);

    let sent = upstream.last_body();
    assert_eq!(sent["stream"], true);
    assert_eq!(sent["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn test_local_rate_limit_rejects_with_retry_after() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Echo).await;
    let mut config = config_for(upstream_addr);
    config.limits.rate_limit = 2;
    let gateway = spawn_gateway(config).await;

    for _ in 0..2 {
        let resp = post_messages(&gateway, &message_request("hi", false)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = post_messages(&gateway, &message_request("hi", false)).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");

    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn test_upstream_429_is_mapped_and_cools_down() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::RateLimited).await;
    let gateway = spawn_gateway(config_for(upstream_addr)).await;

    let resp = post_messages(&gateway, &message_request("hi", false)).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["message"], "Too many requests");

    // The cooldown keeps the next request local.
    let resp = post_messages(&gateway, &message_request("again", false)).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn test_all_flags_off_forwards_everything() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Echo).await;
    let mut config = config_for(upstream_addr);
    config.skip = SkipConfig::none();
    let gateway = spawn_gateway(config).await;

    let mut quota = message_request("check quota", false);
    quota["max_tokens"] = json!(1);
    let resp = post_messages(&gateway, &quota).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["content"][0]["text"], "check quota");
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn test_client_errors() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Echo).await;
    let gateway = spawn_gateway(config_for(upstream_addr)).await;

    let resp = reqwest::Client::new()
        .post(gateway.url("/v1/messages"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let unsupported = json!({
        "model": "claude-sonnet-4-20250514",
        "messages": [{"role": "user", "content": [{"type": "document", "source": {}}]}]
    });
    let resp = post_messages(&gateway, &unsupported).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Unparseable bodies never reach the limiter; a parsed request is admitted once
    // before translation rejects it.
    assert_eq!(upstream.hits(), 0);
    assert_eq!(gateway.state.limiter.in_window(), 1);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let gateway = spawn_gateway(config_for(closed)).await;

    let resp = post_messages(&gateway, &message_request("hi", false)).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_client_disconnect_stops_upstream_read() {
    let (upstream_addr, upstream) = spawn_upstream(Mode::Endless).await;
    let gateway = spawn_gateway(config_for(upstream_addr)).await;

    let mut resp = post_messages(&gateway, &message_request("go on forever", true)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    for _ in 0..3 {
        tokio_test::assert_ok!(resp.chunk().await);
    }
    drop(resp);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !upstream.stream_dropped.load(Ordering::SeqCst) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "upstream body was still being read after the client left"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_long_stream_outlives_read_timeout() {
    let (upstream_addr, _upstream) = spawn_upstream(Mode::Slow { chunks: 12, gap_ms: 200 }).await;
    let mut config = config_for(upstream_addr);
    config.upstream.timeout_secs = 1;
    let gateway = spawn_gateway(config).await;

    let resp = post_messages(&gateway, &message_request("take your time", true)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let events = parse_sse(&resp.text().await.unwrap());

    assert!(events.iter().all(|(name, _)| name != "error"), "{events:?}");
    assert_eq!(text_deltas(&events), "tick ".repeat(12));
    assert_eq!(events.last().map(|(n, _)| n.as_str()), Some("message_stop"));
}

#[tokio::test]
async fn test_auxiliary_endpoints() {
    let (upstream_addr, _upstream) = spawn_upstream(Mode::Echo).await;
    let mut config = config_for(upstream_addr);
    config
        .models
        .insert("claude-haiku".to_string(), "meta/llama-3.1-8b-instruct".to_string());
    let gateway = spawn_gateway(config).await;
    let client = reqwest::Client::new();

    let root: Value = client.get(gateway.url("/")).send().await.unwrap().json().await.unwrap();
    assert_eq!(root["status"], "ok");
    assert_eq!(root["provider"], "nvidia_nim");
    assert_eq!(root["model"], "moonshotai/kimi-k2.5");

    let health: Value = client
        .get(gateway.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let models: Value = client
        .get(gateway.url("/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["claude-haiku", "moonshotai/kimi-k2.5"]);

    let count: Value = client
        .post(gateway.url("/v1/messages/count_tokens"))
        .json(&json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [{"role": "user", "content": "hello world"}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(count["input_tokens"], 5);
}
