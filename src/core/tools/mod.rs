//! Tools the model may call during a turn.
//!
//! The registry resolves calls by exact name. Unknown names go to the
//! registry's fallback tool instead of failing the turn, and every outcome,
//! including a failure, is rendered as text for a `tool` message.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatToolCall, ChatToolDefinition, ChatToolFunction};

pub mod find_files;

pub use find_files::FindFilesTool;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("{tool} failed: {message}")]
    Execution { tool: String, message: String },

    #[error("{0} was cancelled")]
    Cancelled(String),
}

#[async_trait]
pub trait Tool: Send + Sync + 'static {
    /// Name the model uses to call the tool.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Short status line shown while the tool runs.
    fn action(&self) -> &str;

    async fn invoke(
        &self,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<Vec<String>, ToolError>;
}

/// What a single tool call produced, ready to become a `tool` message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool_name: String,
    pub action: String,
    pub content: String,
    pub succeeded: bool,
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    fallback: Arc<dyn Tool>,
}

impl ToolRegistry {
    /// Registry whose fallback is also its first registered tool.
    pub fn new(fallback: Arc<dyn Tool>) -> Self {
        Self {
            tools: vec![fallback.clone()],
            fallback,
        }
    }

    /// Add a tool. A tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|existing| existing.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn resolve(&self, name: &str) -> Arc<dyn Tool> {
        match self.tools.iter().find(|tool| tool.name() == name) {
            Some(tool) => tool.clone(),
            None => {
                warn!(
                    requested = name,
                    fallback = self.fallback.name(),
                    "Model called an unknown tool; using fallback"
                );
                self.fallback.clone()
            }
        }
    }

    pub fn descriptors(&self) -> Vec<ChatToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters(),
                },
            })
            .collect()
    }

    /// Run one call end to end. Never fails: errors become the outcome text.
    pub async fn execute(&self, call: &ChatToolCall, cancel: CancellationToken) -> ToolOutcome {
        let tool = self.resolve(&call.function.name);
        let name = tool.name().to_string();
        debug!(tool = %name, arguments = %call.function.arguments, "Invoking tool");

        let result = match normalize_arguments(&name, &call.function.arguments) {
            Ok(arguments) => match validate_arguments(tool.as_ref(), &arguments) {
                Ok(()) => tool.invoke(arguments, cancel).await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(results) => {
                debug!(tool = %name, results = results.len(), "Tool finished");
                ToolOutcome {
                    content: render_results(&name, &results),
                    tool_name: name,
                    action: tool.action().to_string(),
                    succeeded: true,
                }
            }
            Err(err) => {
                warn!(tool = %name, error = %err, "Tool call failed");
                ToolOutcome {
                    content: render_failure(&name, &err),
                    tool_name: name,
                    action: tool.action().to_string(),
                    succeeded: false,
                }
            }
        }
    }
}

/// Arguments arrive as an object, a JSON-encoded string, or nothing at all.
fn normalize_arguments(tool: &str, raw: &Value) -> Result<Value, ToolError> {
    match raw {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::String(text) if text.trim().is_empty() => Ok(Value::Object(Map::new())),
        Value::String(text) => {
            serde_json::from_str(text).map_err(|err| ToolError::InvalidArguments {
                tool: tool.to_string(),
                message: format!("arguments are not valid JSON: {err}"),
            })
        }
        other => Ok(other.clone()),
    }
}

fn validate_arguments(tool: &dyn Tool, arguments: &Value) -> Result<(), ToolError> {
    let schema = tool.parameters();
    let validator = jsonschema::validator_for(&schema).map_err(|err| ToolError::Execution {
        tool: tool.name().to_string(),
        message: format!("tool schema is invalid: {err}"),
    })?;
    let problems: Vec<String> = validator
        .iter_errors(arguments)
        .map(|err| err.to_string())
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: tool.name().to_string(),
            message: problems.join("; "),
        })
    }
}

fn render_results(tool: &str, results: &[String]) -> String {
    let encoded = serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string());
    format!("Using the {tool} tool results, help the user: {encoded}")
}

fn render_failure(tool: &str, err: &ToolError) -> String {
    format!("The {tool} tool could not complete ({err}). Tell the user what went wrong.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatToolCallFunction;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        fn description(&self) -> &str {
            "Repeats its input"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        fn action(&self) -> &str {
            "Echoing..."
        }

        async fn invoke(
            &self,
            arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Vec<String>, ToolError> {
            let text = arguments["text"].as_str().unwrap_or_default();
            if text == "boom" {
                return Err(ToolError::Execution {
                    tool: "Echo".into(),
                    message: "exploded".into(),
                });
            }
            Ok(vec![text.to_string()])
        }
    }

    fn call(name: &str, arguments: Value) -> ChatToolCall {
        ChatToolCall {
            function: ChatToolCallFunction {
                name: name.to_string(),
                arguments,
            },
        }
    }

    #[tokio::test]
    async fn known_tool_result_is_wrapped() {
        let registry = ToolRegistry::new(Arc::new(Echo));
        let outcome = registry
            .execute(&call("Echo", json!({"text": "hi"})), CancellationToken::new())
            .await;
        assert!(outcome.succeeded);
        assert_eq!(
            outcome.content,
            "Using the Echo tool results, help the user: [\"hi\"]"
        );
        assert_eq!(outcome.action, "Echoing...");
    }

    #[tokio::test]
    async fn unknown_name_uses_fallback() {
        let registry = ToolRegistry::new(Arc::new(Echo));
        let outcome = registry
            .execute(&call("Nope", json!({"text": "x"})), CancellationToken::new())
            .await;
        assert_eq!(outcome.tool_name, "Echo");
        assert!(outcome.succeeded);
    }

    #[tokio::test]
    async fn failures_become_descriptive_outcomes() {
        let registry = ToolRegistry::new(Arc::new(Echo));

        let failed = registry
            .execute(&call("Echo", json!({"text": "boom"})), CancellationToken::new())
            .await;
        assert!(!failed.succeeded);
        assert!(failed.content.contains("exploded"));

        let invalid = registry
            .execute(&call("Echo", json!({"text": 3})), CancellationToken::new())
            .await;
        assert!(!invalid.succeeded);
        assert!(invalid.content.contains("invalid arguments"));
    }

    #[tokio::test]
    async fn string_encoded_arguments_are_accepted() {
        let registry = ToolRegistry::new(Arc::new(Echo));
        let outcome = registry
            .execute(
                &call("Echo", Value::String("{\"text\":\"hey\"}".into())),
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.succeeded);
        assert!(outcome.content.ends_with("[\"hey\"]"));
    }

    #[test]
    fn descriptors_follow_function_shape() {
        let registry = ToolRegistry::new(Arc::new(Echo));
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        let value = serde_json::to_value(&descriptors[0]).expect("serialize");
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["name"], "Echo");
        assert_eq!(value["function"]["parameters"]["required"][0], "text");
    }
}
