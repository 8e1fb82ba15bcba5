use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_error::SpanTrace;

use crate::constants::{
    REASONING_COMPLETED_PLACEHOLDER, REASONING_FINISHED_SENTINEL, REASONING_STARTED_PLACEHOLDER,
};

#[derive(Error, Debug)]
pub enum PalaverError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Stream broken: {0}")]
    StreamBroken(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

/// Error wrapper that captures the span trace at the point of conversion.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: PalaverError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<PalaverError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            PalaverError::Validation(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "VALIDATION_ERROR",
            ),
            PalaverError::NotFound(m) => {
                (axum::http::StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND")
            }
            PalaverError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            PalaverError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            PalaverError::StreamBroken(m) => (
                axum::http::StatusCode::BAD_GATEWAY,
                m.clone(),
                "STREAM_BROKEN",
            ),
            PalaverError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            PalaverError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            PalaverError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            PalaverError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({ "error": msg, "code": code })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CORE ROLES & PARAMETERS ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    #[default]
    Medium,
    High,
}

/// Per-request generation knobs. Value object, copied into each request and
/// persisted alongside the assistant turn it produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParameters {
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
    #[serde(default)]
    pub verbosity: Verbosity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One entry of the conversation context sent upstream. Order is creation
/// order and immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// A retrieval hit surfaced by the upstream file_search tool. Emission order
/// is preserved; duplicates are not collapsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub id: String,
    pub filename: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// --- SESSION STORE RECORDS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub assistant_id: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<GenerationParameters>,
    pub created_at: String,
}

/// --- STREAMING WIRE PROTOCOL ---

/// One interpreted upstream frame. Lifetime is a single parse cycle; frames
/// are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Append to accumulated content.
    ContentDelta(String),
    /// Append to accumulated reasoning.
    ReasoningDelta(String),
    /// The model entered its reasoning phase; show a placeholder.
    ReasoningStarted,
    /// The reasoning phase ended, possibly carrying a summary.
    ReasoningDone { summary: Option<String> },
    /// The whole exchange completed upstream. Terminal delivery still waits
    /// for the explicit `[DONE]` literal.
    ResponseDone { summary: Option<String> },
    /// Creation/progress/retrieval-lifecycle notices. No mutation.
    Meta(String),
    /// Parsed JSON with an unrecognized shape. Logged, never fatal.
    Unknown(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    item: Option<RawOutputItem>,
    #[serde(default)]
    response: Option<RawResponseBody>,
}

#[derive(Deserialize)]
struct RawOutputItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    summary: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawResponseBody {
    #[serde(default)]
    output: Option<Vec<serde_json::Value>>,
}

/// Flattens a reasoning summary payload. The upstream emits either a plain
/// string, an array of strings, or an array of `{type, text}` parts.
pub fn collect_summary(value: &serde_json::Value) -> Option<String> {
    let joined = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                serde_json::Value::String(s) => Some(s.as_str()),
                other => other.get("text").and_then(|t| t.as_str()),
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn response_reasoning_summary(response: &RawResponseBody) -> Option<String> {
    let output = response.output.as_ref()?;
    let mut summary = None;
    for item in output {
        if item.get("type").and_then(|t| t.as_str()) == Some("reasoning") {
            if let Some(s) = item.get("summary").and_then(collect_summary) {
                summary = Some(s);
            }
        }
    }
    summary
}

/// Interprets one `data: ` payload. Malformed JSON is an `Err` the caller
/// skips; everything that parses lands in exactly one `FrameEvent` arm.
pub fn parse_stream_frame(data: &str) -> std::result::Result<FrameEvent, serde_json::Error> {
    let RawFrame {
        kind,
        delta,
        item,
        response,
    } = serde_json::from_str(data)?;

    let event = match kind.as_str() {
        "response.output_text.delta" => match delta {
            Some(d) if !d.is_empty() => FrameEvent::ContentDelta(d),
            _ => FrameEvent::Meta(kind.clone()),
        },
        "response.reasoning.delta" => match delta {
            Some(d) if !d.is_empty() => FrameEvent::ReasoningDelta(d),
            _ => FrameEvent::Meta(kind.clone()),
        },
        "response.output_item.added" => match &item {
            Some(i) if i.kind == "reasoning" => FrameEvent::ReasoningStarted,
            _ => FrameEvent::Meta(kind.clone()),
        },
        "response.output_item.done" => match &item {
            Some(i) if i.kind == "reasoning" => FrameEvent::ReasoningDone {
                summary: i.summary.as_ref().and_then(collect_summary),
            },
            _ => FrameEvent::Meta(kind.clone()),
        },
        "response.done" => FrameEvent::ResponseDone {
            summary: response.as_ref().and_then(response_reasoning_summary),
        },
        "response.output_text.done" | "response.created" | "response.in_progress" => {
            FrameEvent::Meta(kind.clone())
        }
        "" => FrameEvent::Unknown("<missing type>".to_string()),
        other if other.contains("file_search") => FrameEvent::Meta(other.to_string()),
        _ => FrameEvent::Unknown(kind.clone()),
    };
    Ok(event)
}

/// --- THE ACCUMULATED MESSAGE ---

/// Client-facing view of an in-flight generation. Serialized verbatim onto
/// the outward event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageSnapshot {
    pub content: String,
    pub reasoning: String,
    pub citations: Vec<Citation>,
    pub finished: bool,
}

/// Exclusive owner of the in-flight message for one request. Content and
/// reasoning only grow or are replaced by a strictly more complete value;
/// `finish` fires at most once.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    content: String,
    reasoning: String,
    citations: Vec<Citation>,
    finished: bool,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one frame; returns whether anything observable changed, which
    /// is the emission gate for the delivery channel.
    pub fn apply(&mut self, frame: &FrameEvent) -> bool {
        match frame {
            FrameEvent::ContentDelta(delta) => {
                if delta.is_empty() {
                    return false;
                }
                self.content.push_str(delta);
                true
            }
            FrameEvent::ReasoningDelta(delta) => {
                if delta.is_empty() {
                    return false;
                }
                self.reasoning.push_str(delta);
                true
            }
            FrameEvent::ReasoningStarted => {
                self.replace_reasoning(REASONING_STARTED_PLACEHOLDER.to_string())
            }
            FrameEvent::ReasoningDone { summary } => {
                let text = match summary {
                    Some(s) => s.clone(),
                    None => REASONING_COMPLETED_PLACEHOLDER.to_string(),
                };
                self.replace_reasoning(text)
            }
            FrameEvent::ResponseDone { summary } => match summary {
                Some(s) => self.replace_reasoning(s.clone()),
                None => {
                    if self.reasoning.is_empty() {
                        false
                    } else {
                        self.replace_reasoning(REASONING_FINISHED_SENTINEL.to_string())
                    }
                }
            },
            FrameEvent::Meta(_) | FrameEvent::Unknown(_) => false,
        }
    }

    fn replace_reasoning(&mut self, text: String) -> bool {
        if self.reasoning == text {
            return false;
        }
        self.reasoning = text;
        true
    }

    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            content: self.content.clone(),
            reasoning: self.reasoning.clone(),
            citations: self.citations.clone(),
            finished: self.finished,
        }
    }

    /// Marks the message finished and returns the terminal snapshot, or
    /// `None` if the message already finished.
    pub fn finish(&mut self) -> Option<MessageSnapshot> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(self.snapshot())
    }

    pub fn has_output(&self) -> bool {
        !self.content.is_empty() || !self.reasoning.is_empty()
    }

    pub fn content_len(&self) -> usize {
        self.content.len()
    }
}
