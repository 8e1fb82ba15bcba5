use crate::constants::EMPTY_REPLY_FALLBACK;
use crate::projections::ResponsesRequest;
use crate::types::{Citation, PalaverError, Result};

/// Everything a buffered exchange yields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferedReply {
    pub content: String,
    pub reasoning: Option<String>,
    pub citations: Option<Vec<Citation>>,
}

/// Thin client over the remote generation endpoint. The endpoint URL is
/// injectable so tests can point it at a local server.
#[derive(Clone)]
pub struct ResponsesClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl ResponsesClient {
    pub fn new(http: reqwest::Client, api_key: String, endpoint: String) -> Self {
        Self {
            http,
            api_key,
            endpoint,
        }
    }

    /// Single HTTP exchange; the whole reply is parsed out of one JSON body.
    pub async fn call_buffered(&self, request: &ResponsesRequest) -> Result<BufferedReply> {
        let mut request = request.clone();
        request.stream = None;

        let response = self.post(&request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response).await;
            tracing::error!("[☁️ ] Buffered call failed ({}): {}", status, body);
            return Err(PalaverError::Upstream(status, body).into());
        }

        let body: serde_json::Value = response.json().await.map_err(PalaverError::Network)?;
        Ok(parse_buffered_reply(&body))
    }

    /// Opens the long-lived streaming response. Only the handshake is
    /// validated here; the body is consumed by the stream interpreter.
    pub async fn open_stream(&self, request: &ResponsesRequest) -> Result<reqwest::Response> {
        let mut request = request.clone();
        request.stream = Some(true);

        let response = self.post(&request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response).await;
            tracing::error!("[☁️ ] Streaming handshake failed ({}): {}", status, body);
            return Err(PalaverError::Upstream(status, body).into());
        }

        Ok(response)
    }

    async fn post(&self, request: &ResponsesRequest) -> Result<reqwest::Response> {
        self.http
            .post(&self.endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(request)
            .send()
            .await
            .map_err(|e| PalaverError::Network(e).into())
    }
}

async fn read_error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) => text,
        Err(_) => "Unknown error (failed to read response text)".to_string(),
    }
}

/// Extracts content, reasoning summary, and citations out of a buffered
/// Responses API body. Handles the `output_text` shortcut, the structured
/// `output` array, inline `file_citation` annotations, and the legacy
/// `function_call` file_search payload.
pub fn parse_buffered_reply(body: &serde_json::Value) -> BufferedReply {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut citations: Vec<Citation> = Vec::new();

    if let Some(text) = body.get("output_text").and_then(|t| t.as_str()) {
        content.push_str(text);
    } else if let Some(output) = body.get("output").and_then(|o| o.as_array()) {
        for item in output {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("message") => {
                    if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                        for part in parts {
                            collect_message_part(part, &mut content, &mut citations);
                        }
                    }
                }
                Some("text") => {
                    if let Some(text) = item.get("content").and_then(|c| c.as_str()) {
                        content.push_str(text);
                    }
                }
                Some("reasoning") => {
                    if let Some(summary) =
                        item.get("summary").and_then(crate::types::collect_summary)
                    {
                        if !reasoning.is_empty() {
                            reasoning.push(' ');
                        }
                        reasoning.push_str(&summary);
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(output) = body.get("output").and_then(|o| o.as_array()) {
        for item in output {
            collect_legacy_file_search(item, &mut citations);
        }
    }

    BufferedReply {
        content: if content.is_empty() {
            EMPTY_REPLY_FALLBACK.to_string()
        } else {
            content
        },
        reasoning: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        citations: if citations.is_empty() {
            None
        } else {
            Some(citations)
        },
    }
}

fn collect_message_part(
    part: &serde_json::Value,
    content: &mut String,
    citations: &mut Vec<Citation>,
) {
    if let Some(text) = part.as_str() {
        content.push_str(text);
        return;
    }
    match part.get("type").and_then(|t| t.as_str()) {
        Some("output_text") => {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                content.push_str(text);
            }
            collect_annotations(part.get("annotations"), citations);
        }
        Some("text") => {
            if let Some(text) = part.get("content").and_then(|c| c.as_str()) {
                content.push_str(text);
            }
            collect_annotations(part.get("annotations"), citations);
        }
        _ => {}
    }
}

fn collect_annotations(annotations: Option<&serde_json::Value>, citations: &mut Vec<Citation>) {
    let Some(annotations) = annotations.and_then(|a| a.as_array()) else {
        return;
    };
    for ann in annotations {
        if ann.get("type").and_then(|t| t.as_str()) == Some("file_citation") {
            citations.push(Citation {
                id: string_field(ann, "file_id"),
                filename: ann
                    .get("filename")
                    .and_then(|f| f.as_str())
                    .unwrap_or("Unknown")
                    .to_string(),
                content: String::new(),
                page: ann.get("page").and_then(|p| p.as_u64()).map(|p| p as u32),
                source: ann
                    .get("source")
                    .and_then(|s| s.as_str())
                    .map(|s| s.to_string()),
            });
        }
    }
}

fn collect_legacy_file_search(item: &serde_json::Value, citations: &mut Vec<Citation>) {
    let is_file_search_call = item.get("type").and_then(|t| t.as_str()) == Some("function_call")
        && item.get("name").and_then(|n| n.as_str()) == Some("file_search");
    if !is_file_search_call {
        return;
    }
    let Some(result) = item.get("result").and_then(|r| r.as_str()) else {
        return;
    };
    let parsed: serde_json::Value = match serde_json::from_str(result) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to parse file search results: {}", e);
            return;
        }
    };
    let Some(files) = parsed.get("files").and_then(|f| f.as_array()) else {
        return;
    };
    for file in files {
        citations.push(Citation {
            id: string_field(file, "id"),
            filename: file
                .get("filename")
                .and_then(|f| f.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            content: string_field(file, "content"),
            page: file.get("page").and_then(|p| p.as_u64()).map(|p| p as u32),
            source: file
                .get("source")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string()),
        });
    }
}

fn string_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_text_shortcut_wins() {
        let reply = parse_buffered_reply(&serde_json::json!({ "output_text": "direct" }));
        assert_eq!(reply.content, "direct");
        assert!(reply.reasoning.is_none());
        assert!(reply.citations.is_none());
    }

    #[test]
    fn structured_output_concatenates_parts_and_collects_citations() {
        let body = serde_json::json!({
            "output": [
                {
                    "type": "reasoning",
                    "summary": [{"type": "summary_text", "text": "checked the handbook"}]
                },
                {
                    "type": "message",
                    "content": [
                        {
                            "type": "output_text",
                            "text": "See the travel policy.",
                            "annotations": [
                                {"type": "file_citation", "file_id": "file_1", "filename": "policy.pdf", "page": 4}
                            ]
                        },
                        " Appendix B has details."
                    ]
                }
            ]
        });
        let reply = parse_buffered_reply(&body);
        assert_eq!(reply.content, "See the travel policy. Appendix B has details.");
        assert_eq!(reply.reasoning.as_deref(), Some("checked the handbook"));
        let citations = reply.citations.expect("citation collected");
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].filename, "policy.pdf");
        assert_eq!(citations[0].page, Some(4));
    }

    #[test]
    fn legacy_file_search_results_become_citations() {
        let body = serde_json::json!({
            "output": [
                {"type": "text", "content": "From the docs."},
                {
                    "type": "function_call",
                    "name": "file_search",
                    "result": "{\"files\":[{\"id\":\"f1\",\"filename\":\"a.md\",\"content\":\"excerpt\"},{\"id\":\"f2\",\"filename\":\"b.md\",\"content\":\"\"}]}"
                }
            ]
        });
        let reply = parse_buffered_reply(&body);
        assert_eq!(reply.content, "From the docs.");
        let citations = reply.citations.expect("citations collected");
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].content, "excerpt");
        assert_eq!(citations[1].filename, "b.md");
    }

    #[test]
    fn empty_body_falls_back_to_placeholder_content() {
        let reply = parse_buffered_reply(&serde_json::json!({}));
        assert_eq!(reply.content, EMPTY_REPLY_FALLBACK);
    }
}
