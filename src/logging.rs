use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::types::FrameEvent;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics through tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id and opens a span around it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    next.run(req).instrument(span).await
}

/// A stream that ended without its terminal marker. The accumulated state is
/// still delivered, so this is loud but not fatal.
pub fn warn_stream_truncated(request_id: &str, reason: &str, salvaged_chars: usize) {
    warn!(
        target: "stream",
        "{} request {}: {} ({} content chars salvaged)",
        "[STREAM TRUNCATED]".bold().yellow(),
        crate::str_utils::prefix_chars(request_id, 8),
        reason,
        salvaged_chars
    );
}

/// Per-stream counters, logged once at stream end.
#[derive(Default)]
pub struct StreamMetric {
    pub frames: usize,
    pub emitted: usize,
    pub skipped: usize,
    pub unknown: usize,
    pub content_chars: usize,
    pub reasoning_chars: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self, frame: &FrameEvent) {
        self.frames += 1;
        match frame {
            FrameEvent::ContentDelta(delta) => self.content_chars += delta.len(),
            FrameEvent::ReasoningDelta(delta) => self.reasoning_chars += delta.len(),
            FrameEvent::Unknown(_) => self.unknown += 1,
            _ => {}
        }
    }

    pub fn record_emission(&mut self) {
        self.emitted += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn log_summary(&self, request_id: &str) {
        info!(
            target: "stream",
            "[STREAM END] Request: {} | Frames: {} | Emitted: {} | Skipped: {} | Unknown: {} | Content: {} chars | Reasoning: {} chars",
            crate::str_utils::prefix_chars(request_id, 8),
            self.frames,
            self.emitted,
            self.skipped,
            self.unknown,
            self.content_chars,
            self.reasoning_chars
        );
    }
}
