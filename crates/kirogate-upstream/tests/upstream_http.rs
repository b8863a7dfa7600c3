// End-to-end behavior of the auth manager and retrying client against
// fixture upstream servers with scripted status sequences.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::{mpsc, Mutex};

use kirogate_core::GatewayError;
use kirogate_upstream::auth::{Credentials, TokenManager};
use kirogate_upstream::client::KiroClient;
use kirogate_upstream::convert::{ConversationState, Turn};
use kirogate_upstream::events::StreamEvent;
use kirogate_upstream::parser::process_stream;

// ── Fixture upstream ─────────────────────────────────────────────────────────

struct Fixture {
    refresh_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    /// Status codes to answer before a streaming 200. Empty → 200.
    generate_script: Mutex<VecDeque<u16>>,
    /// Text frames the 200 body streams.
    stream_texts: Vec<&'static str>,
    /// Delay between streamed frames.
    frame_delay: Duration,
    /// When set, the refresh endpoint answers with this status instead.
    refresh_status: Option<u16>,
}

impl Fixture {
    fn new(script: &[u16], stream_texts: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            generate_script: Mutex::new(script.iter().copied().collect()),
            stream_texts,
            frame_delay: Duration::ZERO,
            refresh_status: None,
        })
    }
}

fn frame(payload: &str) -> Vec<u8> {
    let total = 12 + payload.len() + 4;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out
}

fn content_frame(text: &str) -> Vec<u8> {
    frame(&serde_json::json!({ "content": text }).to_string())
}

async fn refresh_handler(State(fx): State<Arc<Fixture>>) -> impl IntoResponse {
    let n = fx.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(status) = fx.refresh_status {
        return (StatusCode::from_u16(status).unwrap(), Json(serde_json::json!({}))).into_response();
    }
    let expires = chrono::Utc::now() + chrono::Duration::hours(1);
    Json(serde_json::json!({
        "accessToken": format!("tok-{n}"),
        "refreshToken": "rt-next",
        "expiresAt": expires.to_rfc3339(),
    }))
    .into_response()
}

async fn generate_handler(State(fx): State<Arc<Fixture>>) -> axum::response::Response {
    fx.generate_calls.fetch_add(1, Ordering::SeqCst);
    let next = fx.generate_script.lock().await.pop_front();
    match next {
        Some(200) | None => {
            let texts = fx.stream_texts.clone();
            let delay = fx.frame_delay;
            let body = async_stream::stream! {
                for text in texts {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    yield Ok::<_, Infallible>(bytes::Bytes::from(content_frame(text)));
                }
            };
            Body::from_stream(body).into_response()
        }
        Some(code) => (StatusCode::from_u16(code).unwrap(), "scripted failure").into_response(),
    }
}

async fn spawn_upstream(fx: Arc<Fixture>) -> SocketAddr {
    let app = Router::new()
        .route("/refreshToken", post(refresh_handler))
        .route("/generateAssistantResponse", post(generate_handler))
        .route(
            "/ListAvailableModels",
            get(|| async {
                Json(serde_json::json!({
                    "models": [{"modelId": "CLAUDE_SONNET_4_5_20250929_V1_0"}]
                }))
            }),
        )
        .with_state(fx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn manager(addr: SocketAddr, access_token: Option<&str>) -> Arc<TokenManager> {
    let creds = Credentials {
        access_token: access_token.map(String::from),
        refresh_token: "rt-0".into(),
        expires_at: None,
        profile_arn: None,
        region: None,
    };
    Arc::new(
        TokenManager::new(
            creds,
            format!("http://{addr}/refreshToken"),
            None,
            600,
        )
        .unwrap(),
    )
}

fn client(addr: SocketAddr, auth: Arc<TokenManager>, max_retries: u32) -> KiroClient {
    KiroClient::with_endpoints(
        auth,
        format!("http://{addr}/generateAssistantResponse"),
        format!("http://{addr}/ListAvailableModels"),
        max_retries,
    )
    .unwrap()
}

fn minimal_state() -> ConversationState {
    ConversationState {
        conversation_id: None,
        model_id: "CLAUDE_SONNET_4_5_20250929_V1_0".into(),
        system_prompt: String::new(),
        current_message: Turn {
            role: "user".into(),
            content: "Hi".into(),
            tool_calls: Vec::new(),
            tool_use_id: None,
        },
        history: Vec::new(),
        tools: Vec::new(),
    }
}

async fn collect_events(resp: reqwest::Response) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(process_stream(resp, tx));
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn refresh_on_403_then_success() {
    let fx = Fixture::new(&[403, 200], vec!["Hello"]);
    let addr = spawn_upstream(fx.clone()).await;
    let auth = manager(addr, Some("stale-token"));
    let client = client(addr, auth, 3);

    let resp = client
        .generate_assistant_response(&minimal_state())
        .await
        .unwrap();
    let events = collect_events(resp).await;

    assert_eq!(fx.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.generate_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        events[0],
        StreamEvent::TextDelta {
            text: "Hello".into()
        }
    );
    assert_eq!(
        events.last(),
        Some(&StreamEvent::StreamEnd {
            finish_reason: "stop".into()
        })
    );
}

#[tokio::test]
async fn second_403_fails_with_auth_unavailable() {
    let fx = Fixture::new(&[403, 403], vec![]);
    let addr = spawn_upstream(fx.clone()).await;
    let auth = manager(addr, Some("stale-token"));
    let client = client(addr, auth, 3);

    let err = client
        .generate_assistant_response(&minimal_state())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AuthUnavailable(_)));
    assert_eq!(fx.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rate_limit_backs_off_then_succeeds() {
    let fx = Fixture::new(&[429, 429, 200], vec!["ok"]);
    let addr = spawn_upstream(fx.clone()).await;
    let auth = manager(addr, Some("token"));
    let client = client(addr, auth, 3);

    let started = Instant::now();
    let resp = client
        .generate_assistant_response(&minimal_state())
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert!(resp.status().is_success());
    // 1 s after the first 429, 2 s after the second
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert_eq!(fx.generate_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_with_upstream_unavailable() {
    let fx = Fixture::new(&[500, 500, 500], vec![]);
    let addr = spawn_upstream(fx.clone()).await;
    let auth = manager(addr, Some("token"));
    let client = client(addr, auth, 3);

    let err = client
        .generate_assistant_response(&minimal_state())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamUnavailable(_)));
    assert_eq!(fx.generate_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_retryable_4xx_passes_through_without_retry() {
    let fx = Fixture::new(&[418], vec![]);
    let addr = spawn_upstream(fx.clone()).await;
    let auth = manager(addr, Some("token"));
    let client = client(addr, auth, 3);

    let err = client
        .generate_assistant_response(&minimal_state())
        .await
        .unwrap_err();
    match err {
        GatewayError::UpstreamRejected { status, .. } => assert_eq!(status, 418),
        other => panic!("expected UpstreamRejected, got {other:?}"),
    }
    assert_eq!(fx.generate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_stale_callers_trigger_one_refresh() {
    let fx = Fixture::new(&[], vec![]);
    let addr = spawn_upstream(fx.clone()).await;
    // No access token at all: every caller sees a stale record.
    let auth = manager(addr, None);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let auth = auth.clone();
        handles.push(tokio::spawn(async move { auth.access_token().await }));
    }
    let mut tokens = Vec::new();
    for h in handles {
        tokens.push(h.await.unwrap().unwrap());
    }

    assert_eq!(fx.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(tokens.iter().all(|t| t == "tok-1"));
}

#[tokio::test]
async fn concurrent_forced_refreshes_collapse_into_one() {
    let fx = Fixture::new(&[], vec![]);
    let addr = spawn_upstream(fx.clone()).await;
    // Every caller saw the same token rejected with a 403.
    let auth = manager(addr, Some("rejected-token"));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let auth = auth.clone();
        handles.push(tokio::spawn(
            async move { auth.force_refresh("rejected-token").await },
        ));
    }
    let mut tokens = Vec::new();
    for h in handles {
        tokens.push(h.await.unwrap().unwrap());
    }

    // First caller through the write lock refreshes; the rest find the
    // rejected token already superseded and reuse the result.
    assert_eq!(fx.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(tokens.iter().all(|t| t == "tok-1"));
}

#[tokio::test]
async fn failed_refresh_surfaces_auth_unavailable() {
    let mut inner = Fixture::new(&[], vec![]);
    Arc::get_mut(&mut inner).unwrap().refresh_status = Some(500);
    let addr = spawn_upstream(inner).await;
    let auth = manager(addr, None);

    let err = auth.access_token().await.unwrap_err();
    assert!(matches!(err, GatewayError::AuthUnavailable(_)));
}

#[tokio::test]
async fn dropped_receiver_stops_the_pump() {
    // 6 frames at 300 ms apiece: the fixture would stream for ~1.8 s, so a
    // pump that only stops at body end fails the 1 s bound below.
    let mut inner = Fixture::new(&[200], vec!["a", "b", "c", "d", "e", "f"]);
    Arc::get_mut(&mut inner).unwrap().frame_delay = Duration::from_millis(300);
    let fx = inner;
    let addr = spawn_upstream(fx.clone()).await;
    let auth = manager(addr, Some("token"));
    let client = client(addr, auth, 3);

    let resp = client
        .generate_assistant_response(&minimal_state())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    let pump = tokio::spawn(process_stream(resp, tx));

    // Take one event, then disconnect.
    let first = rx.recv().await.unwrap();
    assert!(matches!(first, StreamEvent::TextDelta { .. }));
    drop(rx);

    // The pump must notice the dropped receiver and return well before the
    // fixture would have finished streaming.
    tokio::time::timeout(Duration::from_secs(1), pump)
        .await
        .expect("pump did not stop after client disconnect")
        .unwrap();
    assert_eq!(fx.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn model_list_fetch_round_trips() {
    let fx = Fixture::new(&[], vec![]);
    let addr = spawn_upstream(fx).await;
    let auth = manager(addr, Some("token"));
    let client = client(addr, auth, 3);

    let models = client.list_available_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].model_id, "CLAUDE_SONNET_4_5_20250929_V1_0");
}
