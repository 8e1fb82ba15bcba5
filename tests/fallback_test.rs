use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::sync::mpsc;

use palaver::constants::APOLOGY_MESSAGE;
use palaver::db::{init_db, ChatStore};
use palaver::delivery::{Delivery, DeliveryEvent};
use palaver::projections::project_request;
use palaver::streaming::StreamHandler;
use palaver::types::{
    ConversationTurn, GenerationParameters, PalaverError, ReasoningEffort, Role, Verbosity,
};
use palaver::upstream::ResponsesClient;

#[derive(Clone)]
struct MockUpstream {
    buffered_hits: Arc<AtomicUsize>,
    stream_body: Option<&'static str>,
}

async fn mock_responses(State(mock): State<MockUpstream>, Json(body): Json<serde_json::Value>) -> Response {
    let is_stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

    if is_stream {
        match mock.stream_body {
            Some(sse) => (
                [(header::CONTENT_TYPE, "text/event-stream")],
                sse.to_string(),
            )
                .into_response(),
            None => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": {
                        "message": "Unsupported value: 'stream' is not available with this param set",
                        "code": "unsupported_value",
                        "param": "stream"
                    }
                })),
            )
                .into_response(),
        }
    } else {
        mock.buffered_hits.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({ "output_text": "buffered reply" })).into_response()
    }
}

async fn spawn_upstream(mock: MockUpstream) -> String {
    let app = Router::new().route("/", post(mock_responses)).with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock upstream serves");
    });
    format!("http://{}/", addr)
}

fn parameters() -> GenerationParameters {
    GenerationParameters {
        model: "gpt-5-mini".into(),
        temperature: 0.7,
        reasoning_effort: ReasoningEffort::Medium,
        verbosity: Verbosity::Medium,
        max_tokens: None,
    }
}

fn history() -> Vec<ConversationTurn> {
    vec![ConversationTurn {
        role: Role::User,
        content: "Hi".into(),
    }]
}

async fn test_store() -> (ChatStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_db(dir.path().join("test.db")).await.expect("init db");
    (ChatStore::new(pool), dir)
}

async fn collect(mut rx: mpsc::Receiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn streaming_rejection_falls_back_to_exactly_one_buffered_call() {
    let hits = Arc::new(AtomicUsize::new(0));
    let endpoint = spawn_upstream(MockUpstream {
        buffered_hits: hits.clone(),
        stream_body: None,
    })
    .await;

    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let upstream = ResponsesClient::new(reqwest::Client::new(), "test-key".into(), endpoint);
    let request = project_request(&history(), None, &parameters());

    let (tx, rx) = mpsc::channel(64);
    StreamHandler::run_exchange(
        upstream,
        store.clone(),
        session.id.clone(),
        "req-fallback".into(),
        request,
        parameters(),
        Delivery::new(tx),
    )
    .await;

    let events = collect(rx).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one buffered retry");

    assert_eq!(events.len(), 2, "one terminal snapshot plus the done marker");
    match &events[0] {
        DeliveryEvent::Snapshot(snapshot) => {
            assert!(snapshot.finished);
            assert_eq!(snapshot.content, "buffered reply");
        }
        other => panic!("Expected terminal snapshot, got {:?}", other),
    }
    assert_eq!(events[1], DeliveryEvent::Done);

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "buffered reply");
}

#[tokio::test]
async fn unrelated_handshake_failure_delivers_persisted_apology() {
    async fn always_500() -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": { "message": "upstream exploded" } })),
        )
            .into_response()
    }
    let app = Router::new().route("/", post(always_500));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock upstream serves");
    });

    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let upstream = ResponsesClient::new(
        reqwest::Client::new(),
        "test-key".into(),
        format!("http://{}/", addr),
    );
    let request = project_request(&history(), None, &parameters());

    let (tx, rx) = mpsc::channel(64);
    StreamHandler::run_exchange(
        upstream,
        store.clone(),
        session.id.clone(),
        "req-fatal".into(),
        request,
        parameters(),
        Delivery::new(tx),
    )
    .await;

    let events = collect(rx).await;
    match &events[0] {
        DeliveryEvent::Snapshot(snapshot) => {
            assert!(snapshot.finished);
            assert_eq!(snapshot.content, APOLOGY_MESSAGE);
        }
        other => panic!("Expected apology snapshot, got {:?}", other),
    }
    assert_eq!(events.last(), Some(&DeliveryEvent::Done));

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, APOLOGY_MESSAGE);
    assert_eq!(messages[0].role, Role::Assistant);
}

#[tokio::test]
async fn successful_stream_flows_end_to_end_through_the_exchange() {
    let endpoint = spawn_upstream(MockUpstream {
        buffered_hits: Arc::new(AtomicUsize::new(0)),
        stream_body: Some(
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hello\"}\n\n\
             data: {\"type\":\"response.output_text.delta\",\"delta\":\" there\"}\n\n\
             data: [DONE]\n\n",
        ),
    })
    .await;

    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let upstream = ResponsesClient::new(reqwest::Client::new(), "test-key".into(), endpoint);
    let request = project_request(&history(), None, &parameters());

    let (tx, rx) = mpsc::channel(64);
    StreamHandler::run_exchange(
        upstream,
        store.clone(),
        session.id.clone(),
        "req-stream".into(),
        request,
        parameters(),
        Delivery::new(tx),
    )
    .await;

    let events = collect(rx).await;
    let snapshots: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DeliveryEvent::Snapshot(s) => Some(s),
            DeliveryEvent::Done => None,
        })
        .collect();

    assert_eq!(snapshots.len(), 3);
    assert_eq!(snapshots[0].content, "Hello");
    assert_eq!(snapshots[2].content, "Hello there");
    assert!(snapshots[2].finished);

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages[0].content, "Hello there");
}

#[tokio::test]
async fn buffered_call_surfaces_upstream_status_and_body() {
    async fn always_500() -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string()).into_response()
    }
    let app = Router::new().route("/", post(always_500));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock upstream serves");
    });

    let upstream = ResponsesClient::new(
        reqwest::Client::new(),
        "test-key".into(),
        format!("http://{}/", addr),
    );
    let request = project_request(&history(), None, &parameters());

    let err = upstream
        .call_buffered(&request)
        .await
        .expect_err("500 must surface as an error");
    match err.inner {
        PalaverError::Upstream(status, body) => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "boom");
        }
        other => panic!("Expected Upstream error, got {:?}", other),
    }
}
