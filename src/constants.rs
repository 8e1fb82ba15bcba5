/// OpenAI Responses API endpoint. Overridable via `--upstream-url` for tests
/// and proxies.
pub const OPENAI_RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

/// Models selectable from the settings panel.
pub const AVAILABLE_MODELS: &[&str] = &[
    "gpt-5-mini",
    "gpt-5",
    "gpt-4.1-mini",
    "gpt-4.1",
    "gpt-4o-mini",
    "gpt-4o",
];

/// Model families that reject a `temperature` field outright.
pub const NO_TEMPERATURE_MODEL_PATTERN: &str = r"^gpt-5";

/// SSE framing shared by the upstream protocol and our outward channel.
pub const SSE_DATA_PREFIX: &str = "data: ";
pub const SSE_DONE_MARKER: &str = "[DONE]";

/// Placeholder reasoning text shown while the model is in its reasoning phase
/// but has not produced a summary yet.
pub const REASONING_STARTED_PLACEHOLDER: &str = "Starting to think about your question...";
/// Shown when the reasoning phase ends without a usable summary.
pub const REASONING_COMPLETED_PLACEHOLDER: &str = "Completed reasoning phase";
/// Final reasoning sentinel when the response completes and no summary ever
/// arrived.
pub const REASONING_FINISHED_SENTINEL: &str = "Done";

/// Persisted as the assistant turn whenever generation fails unrecoverably.
pub const APOLOGY_MESSAGE: &str =
    "Sorry, I encountered an error processing your request. Please try again.";

/// Buffered replies that decode to nothing still need visible content.
pub const EMPTY_REPLY_FALLBACK: &str = "No response content";

/// Upper bounds on a single upstream stream.
pub const MAX_STREAM_LINES: usize = 100_000;
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

pub const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Auth cookie issued by the login endpoint.
pub const AUTH_COOKIE_NAME: &str = "palaver_auth";
pub const AUTH_COOKIE_MAX_AGE_SECS: u64 = 24 * 60 * 60;
