use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use palaver::constants::{APOLOGY_MESSAGE, MAX_LINE_BYTES, REASONING_FINISHED_SENTINEL};
use palaver::db::{init_db, ChatStore};
use palaver::delivery::{Delivery, DeliveryEvent};
use palaver::streaming::StreamHandler;
use palaver::types::{GenerationParameters, MessageSnapshot, ReasoningEffort, Role, Verbosity};

type ByteChunks =
    futures_util::stream::Iter<std::vec::IntoIter<std::result::Result<Bytes, std::io::Error>>>;

fn framed(
    chunks: Vec<std::result::Result<Bytes, std::io::Error>>,
) -> FramedRead<StreamReader<ByteChunks, Bytes>, LinesCodec> {
    FramedRead::new(
        StreamReader::new(futures_util::stream::iter(chunks)),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    )
}

fn sse_body(frames: &[&str]) -> String {
    frames
        .iter()
        .map(|frame| format!("data: {}\n\n", frame))
        .collect()
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

async fn test_store() -> (ChatStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_db(dir.path().join("test.db")).await.expect("init db");
    (ChatStore::new(pool), dir)
}

async fn run_stream(
    store: &ChatStore,
    session_id: &str,
    chunks: Vec<std::result::Result<Bytes, std::io::Error>>,
) -> Vec<DeliveryEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    StreamHandler::handle_stream(
        framed(chunks),
        store.clone(),
        session_id.to_string(),
        "req-test".to_string(),
        parameters(),
        Delivery::new(tx),
    )
    .await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn snapshots(events: &[DeliveryEvent]) -> Vec<MessageSnapshot> {
    events
        .iter()
        .filter_map(|e| match e {
            DeliveryEvent::Snapshot(s) => Some(s.clone()),
            DeliveryEvent::Done => None,
        })
        .collect()
}

#[tokio::test]
async fn hello_there_scenario_emits_two_partials_and_one_terminal() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[
        r#"{"type":"response.output_text.delta","delta":"Hello"}"#,
        r#"{"type":"response.output_text.delta","delta":" there"}"#,
        "[DONE]",
    ]);
    let events = run_stream(&store, &session.id, vec![Ok(Bytes::from(body))]).await;

    let snaps = snapshots(&events);
    assert_eq!(snaps.len(), 3);
    assert_eq!(snaps[0].content, "Hello");
    assert!(!snaps[0].finished);
    assert_eq!(snaps[1].content, "Hello there");
    assert!(!snaps[1].finished);
    assert_eq!(snaps[2].content, "Hello there");
    assert!(snaps[2].finished);

    assert_eq!(events.last(), Some(&DeliveryEvent::Done));

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[0].content, "Hello there");
    assert_eq!(messages[0].parameters.as_ref().map(|p| p.model.as_str()), Some("gpt-5-mini"));
}

#[tokio::test]
async fn meta_frames_produce_no_events() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[
        r#"{"type":"response.created"}"#,
        r#"{"type":"response.output_text.delta","delta":"Hi"}"#,
        r#"{"type":"response.in_progress"}"#,
        r#"{"type":"response.file_search_call.searching"}"#,
        "[DONE]",
    ]);
    let events = run_stream(&store, &session.id, vec![Ok(Bytes::from(body))]).await;

    let snaps = snapshots(&events);
    assert_eq!(snaps.len(), 2, "one content change plus the terminal snapshot");
    assert!(snaps[1].finished);
}

#[tokio::test]
async fn exactly_one_finished_event_and_it_is_last() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[
        r#"{"type":"response.output_text.delta","delta":"a"}"#,
        r#"{"type":"response.output_text.delta","delta":"b"}"#,
        "[DONE]",
    ]);
    let events = run_stream(&store, &session.id, vec![Ok(Bytes::from(body))]).await;

    let snaps = snapshots(&events);
    let finished: Vec<_> = snaps.iter().filter(|s| s.finished).collect();
    assert_eq!(finished.len(), 1);
    assert!(snaps.last().expect("events emitted").finished);
}

#[tokio::test]
async fn close_without_done_synthesizes_terminal_from_accumulated_state() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[
        r#"{"type":"response.output_text.delta","delta":"one "}"#,
        r#"{"type":"response.output_text.delta","delta":"two "}"#,
        r#"{"type":"response.output_text.delta","delta":"three"}"#,
    ]);
    let events = run_stream(&store, &session.id, vec![Ok(Bytes::from(body))]).await;

    let snaps = snapshots(&events);
    let finished: Vec<_> = snaps.iter().filter(|s| s.finished).collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].content, "one two three");
    assert_eq!(events.last(), Some(&DeliveryEvent::Done));

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages[0].content, "one two three");
}

#[tokio::test]
async fn broken_stream_after_output_finishes_with_partial_content() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[r#"{"type":"response.output_text.delta","delta":"partial"}"#]);
    let chunks = vec![
        Ok(Bytes::from(body)),
        Err(std::io::Error::other("connection reset by peer")),
    ];
    let events = run_stream(&store, &session.id, chunks).await;

    let snaps = snapshots(&events);
    let terminal = snaps.last().expect("terminal emitted");
    assert!(terminal.finished);
    assert_eq!(terminal.content, "partial");
}

#[tokio::test]
async fn broken_stream_with_no_output_delivers_persisted_apology() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
        vec![Err(std::io::Error::other("connection reset by peer"))];
    let events = run_stream(&store, &session.id, chunks).await;

    let snaps = snapshots(&events);
    assert_eq!(snaps.len(), 1);
    assert!(snaps[0].finished);
    assert_eq!(snaps[0].content, APOLOGY_MESSAGE);

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, APOLOGY_MESSAGE);
}

#[tokio::test]
async fn malformed_frames_are_skipped_without_losing_the_stream() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[
        "{this is not json",
        r#"{"type":"response.output_text.delta","delta":"kept"}"#,
        "[DONE]",
    ]);
    let events = run_stream(&store, &session.id, vec![Ok(Bytes::from(body))]).await;

    let snaps = snapshots(&events);
    assert_eq!(snaps.last().expect("terminal emitted").content, "kept");
}

#[tokio::test]
async fn reasoning_lifecycle_ends_with_done_sentinel() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let body = sse_body(&[
        r#"{"type":"response.output_item.added","item":{"type":"reasoning"}}"#,
        r#"{"type":"response.output_item.done","item":{"type":"reasoning","summary":[]}}"#,
        r#"{"type":"response.output_text.delta","delta":"answer"}"#,
        r#"{"type":"response.done","response":{}}"#,
        "[DONE]",
    ]);
    let events = run_stream(&store, &session.id, vec![Ok(Bytes::from(body))]).await;

    let snaps = snapshots(&events);
    let terminal = snaps.last().expect("terminal emitted");
    assert_eq!(terminal.content, "answer");
    assert_eq!(terminal.reasoning, REASONING_FINISHED_SENTINEL);

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert_eq!(messages[0].reasoning.as_deref(), Some(REASONING_FINISHED_SENTINEL));
}

#[tokio::test]
async fn replaying_the_same_frames_yields_identical_event_sequences() {
    let (store, _dir) = test_store().await;
    let first = store.create_session("a", "asst_demo").await.expect("session");
    let second = store.create_session("b", "asst_demo").await.expect("session");

    let frames = [
        r#"{"type":"response.output_item.added","item":{"type":"reasoning"}}"#,
        r#"{"type":"response.output_text.delta","delta":"x"}"#,
        r#"{"type":"response.output_text.delta","delta":"y"}"#,
        r#"{"type":"response.done","response":{}}"#,
        "[DONE]",
    ];

    let run_a = run_stream(&store, &first.id, vec![Ok(Bytes::from(sse_body(&frames)))]).await;
    let run_b = run_stream(&store, &second.id, vec![Ok(Bytes::from(sse_body(&frames)))]).await;
    assert_eq!(run_a, run_b);
}

#[tokio::test]
async fn consumer_disconnect_stops_the_stream_without_persisting() {
    let (store, _dir) = test_store().await;
    let session = store.create_session("chat", "asst_demo").await.expect("session");

    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let body = sse_body(&[
        r#"{"type":"response.output_text.delta","delta":"unseen"}"#,
        "[DONE]",
    ]);
    StreamHandler::handle_stream(
        framed(vec![Ok(Bytes::from(body))]),
        store.clone(),
        session.id.clone(),
        "req-test".to_string(),
        parameters(),
        Delivery::new(tx),
    )
    .await;

    let messages = store.session_messages(&session.id).await.expect("messages");
    assert!(messages.is_empty(), "nothing persisted after the consumer left");
}
