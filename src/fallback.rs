use crate::constants::APOLOGY_MESSAGE;
use crate::db::ChatStore;
use crate::delivery::Delivery;
use crate::projections::ResponsesRequest;
use crate::types::{GenerationParameters, MessageSnapshot, ObservedError, PalaverError, Role};
use crate::upstream::ResponsesClient;

/// How a failed streaming attempt should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFailure {
    /// The upstream rejected the streaming flag itself; retry buffered.
    StreamingUnsupported,
    /// Anything else: deliver the apology, do not retry.
    Fatal,
}

/// Textual heuristic over the upstream error body: a parameter rejection
/// that names the stream flag, or an explicit unsupported_value marker.
pub fn is_streaming_unsupported(body: &str) -> bool {
    (body.contains("param") && body.contains("stream")) || body.contains("unsupported_value")
}

pub fn classify_stream_failure(err: &ObservedError) -> StreamFailure {
    match &err.inner {
        PalaverError::Upstream(_, body) if is_streaming_unsupported(body) => {
            StreamFailure::StreamingUnsupported
        }
        _ => StreamFailure::Fatal,
    }
}

/// Retries the identical request as a single buffered call and re-presents
/// the result through the outward channel as one terminal snapshot. On
/// success the caller cannot tell this apart from a short stream.
pub async fn run_buffered_fallback(
    upstream: &ResponsesClient,
    store: &ChatStore,
    session_id: &str,
    request: &ResponsesRequest,
    parameters: &GenerationParameters,
    delivery: &Delivery,
) {
    tracing::warn!(
        "[⚙️ ] Upstream rejected streaming for session {}; retrying buffered",
        crate::str_utils::prefix_chars(session_id, 8)
    );

    match upstream.call_buffered(request).await {
        Ok(reply) => {
            let snapshot = MessageSnapshot {
                content: reply.content.clone(),
                reasoning: reply.reasoning.clone().unwrap_or_default(),
                citations: reply.citations.clone().unwrap_or_default(),
                finished: true,
            };

            if let Err(e) = store
                .append_message(
                    session_id,
                    Role::Assistant,
                    &reply.content,
                    reply.reasoning.as_deref(),
                    reply.citations.as_deref(),
                    Some(parameters),
                )
                .await
            {
                tracing::error!("Failed to persist fallback reply: {}", e);
            }

            if delivery.send_snapshot(snapshot).await {
                delivery.finish().await;
            }
        }
        Err(e) => {
            tracing::error!("[⚙️ ] Buffered fallback failed: {}", e);
            deliver_apology(store, session_id, delivery).await;
        }
    }
}

/// Terminal failure path: the chat always receives a finished message, and
/// the apology is persisted so the conversation history stays consistent.
pub async fn deliver_apology(store: &ChatStore, session_id: &str, delivery: &Delivery) {
    if let Err(e) = store
        .append_message(session_id, Role::Assistant, APOLOGY_MESSAGE, None, None, None)
        .await
    {
        tracing::error!("Failed to persist apology message: {}", e);
    }

    let snapshot = MessageSnapshot {
        content: APOLOGY_MESSAGE.to_string(),
        reasoning: String::new(),
        citations: Vec::new(),
        finished: true,
    };
    if delivery.send_snapshot(snapshot).await {
        delivery.finish().await;
    }
}
