use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::constants::{MAX_LINE_BYTES, MAX_STREAM_LINES, SSE_DATA_PREFIX, SSE_DONE_MARKER};
use crate::db::ChatStore;
use crate::delivery::Delivery;
use crate::fallback::{self, StreamFailure};
use crate::projections::ResponsesRequest;
use crate::types::{parse_stream_frame, FrameEvent, GenerationParameters, MessageAccumulator, Role};
use crate::upstream::ResponsesClient;

/// Advisory phase of the exchange, tracked for logging only. Content and
/// reasoning deltas may interleave, so the accumulated fields stay
/// independent of this label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Content,
    Reasoning,
    Done,
}

impl StreamPhase {
    fn advance(self, frame: &FrameEvent) -> StreamPhase {
        match frame {
            FrameEvent::ContentDelta(_) => StreamPhase::Content,
            FrameEvent::ReasoningDelta(_) | FrameEvent::ReasoningStarted => StreamPhase::Reasoning,
            FrameEvent::ReasoningDone { .. } => StreamPhase::Content,
            FrameEvent::ResponseDone { .. } => StreamPhase::Done,
            FrameEvent::Meta(_) | FrameEvent::Unknown(_) => self,
        }
    }
}

/// How the upstream frame sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamOutcome {
    /// The explicit `[DONE]` literal arrived.
    Completed,
    /// The connection closed cleanly but the terminal marker never came.
    ClosedWithoutMarker,
    /// A read failed mid-stream.
    Broken(String),
}

pub struct StreamHandler;

impl StreamHandler {
    /// One full streaming exchange: handshake, interpretation, persistence,
    /// terminal delivery. Falls back to a buffered call when the upstream
    /// rejects the streaming flag itself.
    pub async fn run_exchange(
        upstream: ResponsesClient,
        store: ChatStore,
        session_id: String,
        request_id: String,
        request: ResponsesRequest,
        parameters: GenerationParameters,
        delivery: Delivery,
    ) {
        match upstream.open_stream(&request).await {
            Ok(response) => {
                let bytes_stream = response
                    .bytes_stream()
                    .map(|r| r.map_err(std::io::Error::other));
                let lines_stream = FramedRead::new(
                    tokio_util::io::StreamReader::new(bytes_stream),
                    LinesCodec::new_with_max_length(MAX_LINE_BYTES),
                );
                Self::handle_stream(
                    lines_stream,
                    store,
                    session_id,
                    request_id,
                    parameters,
                    delivery,
                )
                .await;
            }
            Err(e) => match fallback::classify_stream_failure(&e) {
                StreamFailure::StreamingUnsupported => {
                    fallback::run_buffered_fallback(
                        &upstream,
                        &store,
                        &session_id,
                        &request,
                        &parameters,
                        &delivery,
                    )
                    .await;
                }
                StreamFailure::Fatal => {
                    tracing::error!("[☁️  -> ⚙️ ] Streaming attempt failed: {}", e);
                    fallback::deliver_apology(&store, &session_id, &delivery).await;
                }
            },
        }
    }

    /// Consumes the upstream frame stream, emitting a snapshot whenever the
    /// accumulated message actually changes. The terminal snapshot is emitted
    /// exactly once on every path that still has a consumer.
    pub async fn handle_stream<R>(
        mut lines_stream: FramedRead<tokio_util::io::StreamReader<R, Bytes>, LinesCodec>,
        store: ChatStore,
        session_id: String,
        request_id: String,
        parameters: GenerationParameters,
        delivery: Delivery,
    ) where
        R: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
    {
        let mut accumulator = MessageAccumulator::new();
        let mut metrics = crate::logging::StreamMetric::new();
        let mut phase = StreamPhase::Idle;
        let mut line_count = 0usize;
        let mut outcome = StreamOutcome::ClosedWithoutMarker;

        while let Some(line_result) = lines_stream.next().await {
            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                outcome = StreamOutcome::Broken(format!(
                    "stream exceeded max line limit ({})",
                    MAX_STREAM_LINES
                ));
                break;
            }

            match line_result {
                Ok(line) => {
                    let Some(data) = line.strip_prefix(SSE_DATA_PREFIX) else {
                        continue;
                    };

                    if data == SSE_DONE_MARKER {
                        tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                        outcome = StreamOutcome::Completed;
                        break;
                    }

                    match parse_stream_frame(data) {
                        Ok(frame) => {
                            metrics.record_frame(&frame);

                            let next_phase = phase.advance(&frame);
                            if next_phase != phase {
                                tracing::trace!(
                                    "[⚙️ ] Stream phase {:?} -> {:?}",
                                    phase,
                                    next_phase
                                );
                                phase = next_phase;
                            }
                            if let FrameEvent::Unknown(kind) = &frame {
                                tracing::warn!("[☁️  -> ⚙️ ] Unknown frame shape: {}", kind);
                            }

                            if accumulator.apply(&frame) {
                                metrics.record_emission();
                                if !delivery.send_snapshot(accumulator.snapshot()).await {
                                    tracing::trace!(
                                        "Client disconnected, releasing upstream stream"
                                    );
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            metrics.record_skipped();
                            tracing::warn!("[☁️  -> ⚙️ ] Skipping malformed frame: {}", e);
                        }
                    }
                }
                Err(e) => {
                    let broken = crate::types::PalaverError::StreamBroken(e.to_string());
                    tracing::error!("[☁️  -> ⚙️ ] {}", broken);
                    outcome = StreamOutcome::Broken(e.to_string());
                    break;
                }
            }
        }

        Self::finish_stream(
            accumulator,
            outcome,
            phase,
            &store,
            &session_id,
            &request_id,
            &parameters,
            &delivery,
            &metrics,
        )
        .await;
    }

    /// Terminal handling. A completed stream and a truncated-but-productive
    /// stream both finish from the accumulated state; a stream that broke
    /// before producing anything degrades to the apology path.
    #[allow(clippy::too_many_arguments)]
    async fn finish_stream(
        mut accumulator: MessageAccumulator,
        outcome: StreamOutcome,
        phase: StreamPhase,
        store: &ChatStore,
        session_id: &str,
        request_id: &str,
        parameters: &GenerationParameters,
        delivery: &Delivery,
        metrics: &crate::logging::StreamMetric,
    ) {
        match &outcome {
            StreamOutcome::Completed => {}
            StreamOutcome::ClosedWithoutMarker => {
                crate::logging::warn_stream_truncated(
                    request_id,
                    "connection closed without [DONE]",
                    accumulator.content_len(),
                );
            }
            StreamOutcome::Broken(reason) => {
                if accumulator.has_output() {
                    crate::logging::warn_stream_truncated(
                        request_id,
                        reason,
                        accumulator.content_len(),
                    );
                } else {
                    tracing::error!(
                        "[⚙️ ] Stream broke before any output for request {}: {}",
                        crate::str_utils::prefix_chars(request_id, 8),
                        reason
                    );
                    fallback::deliver_apology(store, session_id, delivery).await;
                    metrics.log_summary(request_id);
                    return;
                }
            }
        }

        tracing::debug!("[⚙️ ] Stream finished in phase {:?}", phase);

        let Some(terminal) = accumulator.finish() else {
            return;
        };

        let reasoning = if terminal.reasoning.is_empty() {
            None
        } else {
            Some(terminal.reasoning.as_str())
        };
        let citations = if terminal.citations.is_empty() {
            None
        } else {
            Some(terminal.citations.as_slice())
        };
        if let Err(e) = store
            .append_message(
                session_id,
                Role::Assistant,
                &terminal.content,
                reasoning,
                citations,
                Some(parameters),
            )
            .await
        {
            tracing::error!("Failed to persist assistant turn: {}", e);
        }

        if delivery.send_snapshot(terminal).await {
            delivery.finish().await;
        }
        metrics.log_summary(request_id);
    }
}
