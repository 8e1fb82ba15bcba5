use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::assistants::Assistant;
use crate::constants::NO_TEMPERATURE_MODEL_PATTERN;
use crate::types::{ConversationTurn, GenerationParameters, ReasoningEffort, Role};

lazy_static! {
    static ref NO_TEMPERATURE_FAMILY: Regex =
        Regex::new(NO_TEMPERATURE_MODEL_PATTERN).expect("Invalid no-temperature model pattern");
}

/// Whether the model accepts a `temperature` field. Unknown models fall
/// through permissively.
pub fn model_accepts_temperature(model: &str) -> bool {
    !NO_TEMPERATURE_FAMILY.is_match(model)
}

/// --- UPSTREAM REQUEST WIRE TYPES ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsesMessage {
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

impl ResponsesMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            kind: "message".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningOptions {
    pub effort: ReasoningEffort,
}

/// The Responses API expects `vector_store_ids` at the tool level, not
/// nested under a `file_search` object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub vector_store_ids: Vec<String>,
}

impl RetrievalTool {
    pub fn file_search(vector_store_ids: Vec<String>) -> Self {
        Self {
            kind: "file_search".to_string(),
            vector_store_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<ResponsesMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub reasoning: ReasoningOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<RetrievalTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// Projects conversation history + assistant configuration + caller
/// parameters into one upstream request. The system message is prepended
/// when the assistant carries one; the retrieval tool is attached only when
/// the assistant has configured stores. `verbosity` stays local.
pub fn project_request(
    history: &[ConversationTurn],
    assistant: Option<&Assistant>,
    parameters: &GenerationParameters,
) -> ResponsesRequest {
    let system_message = assistant.and_then(|a| a.system_message.as_deref());

    let mut input = Vec::with_capacity(history.len() + 1);
    if let Some(system) = system_message {
        input.push(ResponsesMessage::new(Role::System, system));
    }
    input.extend(
        history
            .iter()
            .map(|turn| ResponsesMessage::new(turn.role, turn.content.clone())),
    );

    let temperature = if model_accepts_temperature(&parameters.model) {
        Some(parameters.temperature)
    } else {
        tracing::debug!(
            "Model {} rejects temperature; omitting the field",
            parameters.model
        );
        None
    };

    let tools = assistant
        .map(|a| a.vector_store_ids.clone())
        .filter(|ids| !ids.is_empty())
        .map(|ids| {
            tracing::debug!("Attaching file_search tool with stores {:?}", ids);
            vec![RetrievalTool::file_search(ids)]
        });

    ResponsesRequest {
        model: parameters.model.clone(),
        input,
        temperature,
        reasoning: ReasoningOptions {
            effort: parameters.reasoning_effort,
        },
        tools,
        max_output_tokens: parameters.max_tokens,
        stream: None,
    }
}
