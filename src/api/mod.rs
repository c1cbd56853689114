//! Wire payloads for the Ollama-compatible HTTP API.
//!
//! Requests are serialized exactly as the server expects them; response types
//! are lenient (`#[serde(default)]` everywhere) because partial frames omit most
//! fields and servers differ in which statistics they report.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod models;

/// Request-level failures. Anything here aborts the current generation;
/// per-line problems are handled inside the stream decoder instead.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("unexpected response body: {0}")]
    Decode(#[source] reqwest::Error),

    #[error(transparent)]
    Stream(#[from] crate::core::chat_stream::StreamError),

    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Server(String),
}

impl ApiError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ChatOptions {
    pub num_ctx: u32,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ChatToolDefinition>,
}

/// Side-effect-only chat request used to load or evict a model.
///
/// The server keeps a model resident for `keep_alive` seconds; `0` unloads it
/// immediately. No conversational turn is produced.
#[derive(Debug, Serialize)]
pub struct KeepAliveRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub keep_alive: u64,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolFunction,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChatToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One NDJSON frame of a `/api/chat` response.
#[derive(Debug, Deserialize, Default)]
pub struct ChatResponseLine {
    #[serde(default)]
    pub message: Option<ChatResponseMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    #[serde(default)]
    pub eval_count: Option<u64>,
    /// Generation time in nanoseconds.
    #[serde(default)]
    pub eval_duration: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChatToolCall>>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChatToolCall {
    pub function: ChatToolCallFunction,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChatToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct ModelTag {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}

#[derive(Debug, Serialize)]
pub struct PullRequest {
    pub name: String,
    pub stream: bool,
}

/// One NDJSON frame of a `/api/pull` response.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct PullProgressLine {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgressLine {
    /// Download progress in percent, when the frame carries byte counts.
    pub fn percent(&self) -> Option<f64> {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => {
                Some(completed as f64 / total as f64 * 100.0)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_request_omits_empty_tools_and_options() {
        let request = ChatRequest {
            model: "llama3.2".into(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "Hi".into(),
                images: None,
            }],
            options: None,
            tools: Vec::new(),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({
                "model": "llama3.2",
                "messages": [{"role": "user", "content": "Hi"}]
            })
        );
    }

    #[test]
    fn final_frame_carries_statistics() {
        let line = r#"{"model":"m","message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":50,"eval_duration":2000000000}"#;
        let frame: ChatResponseLine = serde_json::from_str(line).expect("parse");
        assert!(frame.done);
        assert_eq!(frame.prompt_eval_count, Some(12));
        assert_eq!(frame.eval_count, Some(50));
        assert_eq!(frame.eval_duration, Some(2_000_000_000));
    }

    #[test]
    fn tool_call_arguments_stay_structured() {
        let line = r#"{"message":{"content":"","tool_calls":[{"function":{"name":"GlobTool","arguments":{"namePattern":"readme"}}}]},"done":false}"#;
        let frame: ChatResponseLine = serde_json::from_str(line).expect("parse");
        let calls = frame
            .message
            .and_then(|message| message.tool_calls)
            .expect("tool calls");
        assert_eq!(calls[0].function.name, "GlobTool");
        assert_eq!(calls[0].function.arguments, json!({"namePattern": "readme"}));
    }

    #[test]
    fn pull_progress_percent_requires_total() {
        let mut line = PullProgressLine {
            status: "downloading".into(),
            total: Some(200),
            completed: Some(50),
            ..Default::default()
        };
        assert_eq!(line.percent(), Some(25.0));
        line.total = None;
        assert_eq!(line.percent(), None);
    }
}
