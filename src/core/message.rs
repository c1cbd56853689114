//! Conversation data model: messages, attachments, conversations and projects.
//!
//! These are the persisted shapes. Field names serialize in camelCase so a
//! store written by one window can be read by any other.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::api::ChatMessage;

/// Summary shown for a conversation before its first message.
pub const BLANK_CONVERSATION_SUMMARY: &str = "New Conversation";

/// The first user message becomes the summary, cut to this many characters.
pub const SUMMARY_MAX_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// A file attached to a user message.
///
/// `contents` is a data URL (`data:<mime>;base64,<payload>`), so the payload
/// stays self-describing when persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_type: String,
    pub contents: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.file_type.starts_with("image")
    }

    /// The base64 payload without its data-URL prefix.
    pub fn payload(&self) -> &str {
        match self.contents.split_once(',') {
            Some((_, payload)) => payload,
            None => &self.contents,
        }
    }

    fn fence_label(&self) -> &str {
        self.file_type
            .split_once('/')
            .map(|(_, subtype)| subtype)
            .unwrap_or(&self.file_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    /// Progress label of the tool that produced a tool row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_action: Option<String>,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Message {
    fn new(id: String, role: Role, content: impl Into<String>, complete: bool) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
            complete,
            input_tokens: None,
            tokens: None,
            tokens_per_second: None,
            tool_action: None,
        }
    }

    pub fn user(content: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            attachments,
            ..Self::new(new_id(), Role::User, content, true)
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(new_id(), Role::System, content, true)
    }

    /// Empty, still-streaming assistant row for a generation whose id was
    /// allocated up front.
    pub fn assistant_placeholder(id: String) -> Self {
        Self::new(id, Role::Assistant, String::new(), false)
    }

    /// Finished assistant row, used for errors and notices.
    pub fn assistant_notice(id: String, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content, true)
    }

    /// Finished tool row carrying the label shown while the tool ran.
    pub fn tool_result(id: String, content: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            tool_action: Some(action.into()),
            ..Self::new(id, Role::Tool, content, true)
        }
    }

    pub fn is_streaming(&self) -> bool {
        !self.complete
    }

    /// Lower the message to its wire form.
    ///
    /// Image attachments travel as `images`; any other attachment is decoded
    /// and appended to the content as a fenced block.
    pub fn to_api_message(&self) -> ChatMessage {
        let mut content = self.content.clone();
        let mut images = Vec::new();

        for attachment in &self.attachments {
            if attachment.is_image() {
                images.push(attachment.payload().to_string());
                continue;
            }
            match base64::engine::general_purpose::STANDARD.decode(attachment.payload()) {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    content.push_str(&format!(
                        "\n```{}\n{}\n```\n",
                        attachment.fence_label(),
                        text.trim_end()
                    ));
                }
                Err(err) => {
                    warn!(
                        message_id = %self.id,
                        file_type = %attachment.file_type,
                        error = %err,
                        "Skipping attachment with undecodable payload"
                    );
                }
            }
        }

        ChatMessage {
            role: self.role.as_str().to_string(),
            content,
            images: (!images.is_empty()).then_some(images),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn blank() -> Self {
        Self {
            id: new_id(),
            summary: BLANK_CONVERSATION_SUMMARY.to_string(),
            messages: Vec::new(),
        }
    }
}

/// Summary derived from the first user message of a conversation.
pub fn summarize(text: &str) -> String {
    text.trim().chars().take(SUMMARY_MAX_CHARS).collect()
}

/// Routing target that pins a model, context size and system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub system_prompt: String,
}

impl Project {
    pub fn system_prompt(&self) -> Option<&str> {
        let prompt = self.system_prompt.trim();
        (!prompt.is_empty()).then_some(self.system_prompt.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_url(mime: &str, raw: &[u8]) -> String {
        format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    #[test]
    fn image_attachments_become_images() {
        let message = Message::user(
            "what is this?",
            vec![Attachment {
                file_type: "image/png".into(),
                contents: "data:image/png;base64,iVBORw0KGgo=".into(),
            }],
        );
        let api = message.to_api_message();
        assert_eq!(api.role, "user");
        assert_eq!(api.content, "what is this?");
        assert_eq!(api.images, Some(vec!["iVBORw0KGgo=".to_string()]));
    }

    #[test]
    fn text_attachments_are_inlined_as_fenced_blocks() {
        let message = Message::user(
            "review",
            vec![Attachment {
                file_type: "text/x-rust".into(),
                contents: data_url("text/x-rust", b"fn main() {}\n"),
            }],
        );
        let api = message.to_api_message();
        assert_eq!(api.content, "review\n```x-rust\nfn main() {}\n```\n");
        assert_eq!(api.images, None);
    }

    #[test]
    fn undecodable_attachment_is_skipped() {
        let message = Message::user(
            "hi",
            vec![Attachment {
                file_type: "text/plain".into(),
                contents: "data:text/plain;base64,@@not base64@@".into(),
            }],
        );
        assert_eq!(message.to_api_message().content, "hi");
    }

    #[test]
    fn persisted_shape_uses_camel_case() {
        let mut message = Message::assistant_placeholder("m-1".into());
        message.tokens_per_second = Some(25.0);
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["complete"], false);
        assert_eq!(value["tokensPerSecond"], 25.0);
        assert!(value.get("attachments").is_none());
        assert!(value.get("toolAction").is_none());

        let restored: Message = serde_json::from_value(value).expect("deserialize");
        assert_eq!(restored, message);
    }

    #[test]
    fn tool_row_keeps_its_action_label() {
        let message = Message::tool_result("t-1".into(), "[]", "Using file search tool...");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["role"], "tool");
        assert_eq!(value["toolAction"], "Using file search tool...");

        let restored: Message = serde_json::from_value(value).expect("deserialize");
        assert_eq!(restored.tool_action.as_deref(), Some("Using file search tool..."));
    }

    #[test]
    fn summary_is_trimmed_and_capped() {
        assert_eq!(summarize("  hello  "), "hello");
        let long = "é".repeat(150);
        assert_eq!(summarize(&long).chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn blank_system_prompt_is_ignored() {
        let mut project = Project {
            id: "p".into(),
            name: "Docs".into(),
            model: "llama3.2".into(),
            context_length: None,
            system_prompt: "   ".into(),
        };
        assert_eq!(project.system_prompt(), None);
        project.system_prompt = "Be terse".into();
        assert_eq!(project.system_prompt(), Some("Be terse"));
    }
}
