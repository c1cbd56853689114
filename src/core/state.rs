//! Persisted state shapes for the three independent stores.
//!
//! Operations return a new value instead of mutating in place; they are meant
//! to be passed to [`StateContainer::mutate`](crate::core::store::StateContainer::mutate).

use serde::{Deserialize, Serialize};

use crate::core::message::{new_id, Conversation, Message, Project};

pub const DEFAULT_API_URL: &str = "http://localhost:11434";
pub const DEFAULT_GLOBAL_SHORTCUT: &str = "None";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsState {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub active_conversation_id: Option<String>,
}

impl ConversationsState {
    pub fn find(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|convo| convo.id == id)
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active_conversation_id
            .as_deref()
            .and_then(|id| self.find(id))
    }

    /// Messages of the active conversation, empty when there is none.
    pub fn active_messages(&self) -> &[Message] {
        self.active()
            .map(|convo| convo.messages.as_slice())
            .unwrap_or_default()
    }

    /// Start a blank conversation and make it active.
    ///
    /// An active conversation that is still empty is reused instead, so
    /// repeated "new conversation" requests do not pile up blank entries.
    pub fn with_new_conversation(&self) -> (Self, String) {
        if let Some(active) = self.active() {
            if active.messages.is_empty() {
                return (self.clone(), active.id.clone());
            }
        }
        let conversation = Conversation::blank();
        let id = conversation.id.clone();
        let mut next = self.clone();
        next.conversations.push(conversation);
        next.active_conversation_id = Some(id.clone());
        (next, id)
    }

    pub fn with_active(&self, id: &str) -> Option<Self> {
        self.find(id)?;
        let mut next = self.clone();
        next.active_conversation_id = Some(id.to_string());
        Some(next)
    }

    /// Remove a conversation. When it was active, the first remaining one
    /// takes over.
    pub fn without_conversation(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.conversations.retain(|convo| convo.id != id);
        if next.active_conversation_id.as_deref() == Some(id) {
            next.active_conversation_id = next.conversations.first().map(|c| c.id.clone());
        }
        next
    }

    pub fn with_summary(&self, id: &str, summary: impl Into<String>) -> Self {
        let summary = summary.into();
        self.map_conversation(id, |convo| convo.summary = summary)
    }

    pub fn with_messages(&self, id: &str, messages: Vec<Message>) -> Self {
        self.map_conversation(id, |convo| convo.messages = messages)
    }

    pub fn with_message_appended(&self, id: &str, message: Message) -> Option<Self> {
        self.find(id)?;
        Some(self.map_conversation(id, |convo| convo.messages.push(message)))
    }

    /// Replace the message with the same id. `None` when either the
    /// conversation or the message no longer exists.
    pub fn with_message_replaced(&self, id: &str, message: Message) -> Option<Self> {
        let index = self
            .find(id)?
            .messages
            .iter()
            .position(|existing| existing.id == message.id)?;
        Some(self.map_conversation(id, |convo| convo.messages[index] = message))
    }

    /// Mark every unfinished message complete, keeping whatever text it
    /// has. A reply persisted mid-stream would otherwise stay unfinished
    /// forever and never be sent back to the model.
    pub fn with_interrupted_sealed(mut self) -> Self {
        for message in self
            .conversations
            .iter_mut()
            .flat_map(|convo| convo.messages.iter_mut())
            .filter(|message| message.is_streaming())
        {
            message.complete = true;
        }
        self
    }

    fn map_conversation(&self, id: &str, update: impl FnOnce(&mut Conversation)) -> Self {
        let mut next = self.clone();
        if let Some(convo) = next.conversations.iter_mut().find(|convo| convo.id == id) {
            update(convo);
        }
        next
    }
}

/// Partial update for a project; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub model: Option<String>,
    pub context_length: Option<Option<u32>>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectsState {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub selected_project_id: Option<String>,
}

impl ProjectsState {
    pub fn selected(&self) -> Option<&Project> {
        let id = self.selected_project_id.as_deref()?;
        self.projects.iter().find(|project| project.id == id)
    }

    pub fn with_project_added(
        &self,
        name: impl Into<String>,
        model: impl Into<String>,
        context_length: Option<u32>,
        system_prompt: impl Into<String>,
    ) -> (Self, String) {
        let id = new_id();
        let mut next = self.clone();
        next.projects.push(Project {
            id: id.clone(),
            name: name.into(),
            model: model.into(),
            context_length,
            system_prompt: system_prompt.into(),
        });
        (next, id)
    }

    pub fn without_project(&self, id: &str) -> Self {
        let mut next = self.clone();
        next.projects.retain(|project| project.id != id);
        if next.selected_project_id.as_deref() == Some(id) {
            next.selected_project_id = None;
        }
        next
    }

    pub fn with_project_updated(&self, id: &str, update: ProjectUpdate) -> Self {
        let mut next = self.clone();
        if let Some(project) = next.projects.iter_mut().find(|project| project.id == id) {
            if let Some(name) = update.name {
                project.name = name;
            }
            if let Some(model) = update.model {
                project.model = model;
            }
            if let Some(context_length) = update.context_length {
                project.context_length = context_length;
            }
            if let Some(system_prompt) = update.system_prompt {
                project.system_prompt = system_prompt;
            }
        }
        next
    }

    pub fn with_selected(&self, id: &str) -> Self {
        Self {
            selected_project_id: Some(id.to_string()),
            ..self.clone()
        }
    }

    pub fn with_selection_cleared(&self) -> Self {
        Self {
            selected_project_id: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsState {
    pub api_url: String,
    pub global_shortcut: String,
    pub selected_model: String,
    pub available_models: Vec<String>,
}

impl Default for SettingsState {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            global_shortcut: DEFAULT_GLOBAL_SHORTCUT.to_string(),
            selected_model: String::new(),
            available_models: Vec::new(),
        }
    }
}

impl SettingsState {
    pub fn with_api_url(&self, url: impl Into<String>) -> Self {
        Self {
            api_url: url.into(),
            ..self.clone()
        }
    }

    pub fn with_global_shortcut(&self, shortcut: impl Into<String>) -> Self {
        Self {
            global_shortcut: shortcut.into(),
            ..self.clone()
        }
    }

    pub fn with_selected_model(&self, model: impl Into<String>) -> Self {
        Self {
            selected_model: model.into(),
            ..self.clone()
        }
    }

    pub fn with_available_models(&self, models: Vec<String>) -> Self {
        Self {
            available_models: models,
            ..self.clone()
        }
    }
}
