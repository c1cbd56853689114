//! The chat engine ties the stores, the HTTP client and the tool registry
//! together. One engine corresponds to one window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{models, ApiError, PullProgressLine};
use crate::core::cancellation::CancellationController;
use crate::core::message::{summarize, Attachment, Message};
use crate::core::persistence::{
    PersistenceAdapter, PersistenceError, CONVERSATIONS_KEY, PROJECTS_KEY, SETTINGS_KEY,
};
use crate::core::state::{ConversationsState, ProjectsState, SettingsState};
use crate::core::store::StateContainer;
use crate::core::sync::SyncTransport;
use crate::core::tools::ToolRegistry;

mod turn;


pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 300;

/// Shown in place of the assistant reply when the server cannot be reached
/// or sends nothing usable.
pub const DELIVERY_ERROR_MESSAGE: &str =
    "Sorry, there was an error processing your request. Please ensure Ollama is running and try again.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("message is empty")]
    EmptyInput,

    #[error("a reply is already being generated in conversation {conversation_id}")]
    GenerationInFlight { conversation_id: String },

    #[error("no model selected; pick one or select a project with a model")]
    NoModelSelected,

    #[error("no conversation with id {0}")]
    UnknownConversation(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// How a user turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model finished its reply.
    Completed,
    /// `stop()` was called; whatever streamed so far is kept.
    Cancelled,
    /// The request failed and an error message was written instead.
    Failed,
    /// The model kept calling tools past the configured number of rounds.
    ToolLimitReached,
    /// The conversation or its reply disappeared mid-turn.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Consecutive tool rounds allowed in one user turn.
    pub max_tool_rounds: usize,
    /// How long `load_model` asks the server to keep a model resident.
    pub keep_alive_secs: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

/// The three independently persisted containers.
#[derive(Clone)]
pub struct Stores {
    pub conversations: Arc<StateContainer<ConversationsState>>,
    pub projects: Arc<StateContainer<ProjectsState>>,
    pub settings: Arc<StateContainer<SettingsState>>,
}

impl Stores {
    pub async fn load(adapter: &dyn PersistenceAdapter, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            conversations: StateContainer::load_with(
                CONVERSATIONS_KEY,
                adapter,
                CONVERSATIONS_KEY,
                transport.clone(),
                ConversationsState::with_interrupted_sealed,
            )
            .await,
            projects: StateContainer::load(PROJECTS_KEY, adapter, PROJECTS_KEY, transport.clone())
                .await,
            settings: StateContainer::load(SETTINGS_KEY, adapter, SETTINGS_KEY, transport).await,
        }
    }

    pub fn in_memory(transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            conversations: StateContainer::new(
                CONVERSATIONS_KEY,
                ConversationsState::default(),
                transport.clone(),
            ),
            projects: StateContainer::new(PROJECTS_KEY, ProjectsState::default(), transport.clone()),
            settings: StateContainer::new(SETTINGS_KEY, SettingsState::default(), transport),
        }
    }

    /// Start the write-behind and cross-window tasks for every container.
    pub fn spawn_background(&self, adapter: Arc<dyn PersistenceAdapter>) -> Vec<JoinHandle<()>> {
        vec![
            self.conversations
                .spawn_persistence(adapter.clone(), CONVERSATIONS_KEY.to_string()),
            self.projects
                .spawn_persistence(adapter.clone(), PROJECTS_KEY.to_string()),
            self.settings
                .spawn_persistence(adapter, SETTINGS_KEY.to_string()),
            self.conversations.spawn_sync_listener(),
            self.projects.spawn_sync_listener(),
            self.settings.spawn_sync_listener(),
        ]
    }

    /// Write every container now. Each one is attempted even if an earlier
    /// one fails; the first error is returned.
    pub async fn flush(&self, adapter: &dyn PersistenceAdapter) -> Result<(), PersistenceError> {
        let results = [
            self.conversations.persist(adapter, CONVERSATIONS_KEY).await,
            self.projects.persist(adapter, PROJECTS_KEY).await,
            self.settings.persist(adapter, SETTINGS_KEY).await,
        ];
        results.into_iter().collect()
    }
}

struct InFlight {
    generation: u64,
    controller: CancellationController,
}

/// Removes its in-flight entry when the turn ends, however it ends.
struct InFlightGuard {
    map: Arc<Mutex<HashMap<String, InFlight>>>,
    conversation_id: String,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if map
            .get(&self.conversation_id)
            .is_some_and(|entry| entry.generation == self.generation)
        {
            map.remove(&self.conversation_id);
        }
    }
}

/// Model and request options resolved once per user turn.
#[derive(Debug, Clone)]
pub(crate) struct TurnTarget {
    pub api_base: String,
    pub model: String,
    pub context_length: Option<u32>,
}

#[derive(Clone)]
pub struct ChatEngine {
    client: reqwest::Client,
    stores: Stores,
    tools: Arc<ToolRegistry>,
    options: EngineOptions,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    next_generation: Arc<AtomicU64>,
}

impl ChatEngine {
    pub fn new(
        client: reqwest::Client,
        stores: Stores,
        tools: ToolRegistry,
        options: EngineOptions,
    ) -> Self {
        Self {
            client,
            stores,
            tools: Arc::new(tools),
            options,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn conversations(&self) -> &Arc<StateContainer<ConversationsState>> {
        &self.stores.conversations
    }

    pub fn projects(&self) -> &Arc<StateContainer<ProjectsState>> {
        &self.stores.projects
    }

    pub fn settings(&self) -> &Arc<StateContainer<SettingsState>> {
        &self.stores.settings
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Send a user message in the active conversation and drive the reply,
    /// including any tool rounds, to completion.
    ///
    /// Input checks and the in-flight check happen before any state changes,
    /// so a rejected send leaves the stores untouched.
    pub async fn send_message(
        &self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let target = self.resolve_target()?;
        let conversation_id = self.ensure_active_conversation();
        let (controller, _guard) = self.begin_generation(&conversation_id)?;

        let system_prompt = self
            .projects()
            .get()
            .selected()
            .and_then(|project| project.system_prompt().map(str::to_string));
        let user_message = Message::user(text, attachments);
        let appended = self.conversations().try_mutate(|state| {
            let conversation = state.find(&conversation_id)?;
            let first_message = conversation.messages.is_empty();
            let mut messages = conversation.messages.clone();
            if first_message {
                if let Some(prompt) = &system_prompt {
                    messages.push(Message::system(prompt.clone()));
                }
            }
            messages.push(user_message.clone());

            let next = state.with_messages(&conversation_id, messages);
            Some(if first_message {
                next.with_summary(&conversation_id, summarize(text))
            } else {
                next
            })
        });
        if appended.is_none() {
            return Ok(TurnOutcome::Abandoned);
        }

        info!(
            conversation = %conversation_id,
            model = %target.model,
            "Sending message"
        );
        let outcome = self.run_turn(&conversation_id, &target, &controller).await;
        debug!(conversation = %conversation_id, ?outcome, "Turn finished");
        Ok(outcome)
    }

    /// Stop the generation running in the active conversation, if any.
    pub fn stop(&self) -> bool {
        match self.conversations().get().active_conversation_id.clone() {
            Some(id) => self.stop_conversation(&id),
            None => false,
        }
    }

    pub fn stop_conversation(&self, conversation_id: &str) -> bool {
        match self.in_flight.lock().get(conversation_id) {
            Some(entry) => {
                entry.controller.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_generating(&self, conversation_id: &str) -> bool {
        self.in_flight.lock().contains_key(conversation_id)
    }

    /// Start a blank conversation, or reuse the active one if it is empty.
    pub fn new_conversation(&self) -> String {
        let mut created = String::new();
        self.conversations().mutate(|state| {
            let (next, id) = state.with_new_conversation();
            created = id;
            next
        });
        created
    }

    pub fn switch_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        self.conversations()
            .try_mutate(|state| state.with_active(conversation_id))
            .map(|_| ())
            .ok_or_else(|| EngineError::UnknownConversation(conversation_id.to_string()))
    }

    /// Delete a conversation, stopping its generation first.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), EngineError> {
        if self.conversations().get().find(conversation_id).is_none() {
            return Err(EngineError::UnknownConversation(conversation_id.to_string()));
        }
        self.stop_conversation(conversation_id);
        self.conversations()
            .mutate(|state| state.without_conversation(conversation_id));
        Ok(())
    }

    /// Fetch installed models into settings. The selected model falls back to
    /// the first installed one when it is missing from the list.
    pub async fn refresh_models(&self) -> Result<Vec<String>, EngineError> {
        let api_base = self.settings().get().api_url.clone();
        let models = models::fetch_models(&self.client, &api_base).await?;
        self.settings().mutate(|settings| {
            let mut next = settings.with_available_models(models.clone());
            if let Some(first) = models.first() {
                if !models.contains(&next.selected_model) {
                    next = next.with_selected_model(first.clone());
                }
            }
            next
        });
        Ok(models)
    }

    pub async fn load_model(&self, model: &str) -> Result<(), EngineError> {
        let api_base = self.settings().get().api_url.clone();
        models::load_model(&self.client, &api_base, model, self.options.keep_alive_secs).await?;
        Ok(())
    }

    pub async fn unload_model(&self, model: &str) -> Result<(), EngineError> {
        let api_base = self.settings().get().api_url.clone();
        models::unload_model(&self.client, &api_base, model).await?;
        Ok(())
    }

    /// Pull a model and refresh the model list once it is installed.
    pub async fn pull_model<F>(
        &self,
        name: &str,
        cancel: CancellationToken,
        on_progress: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(&PullProgressLine),
    {
        let api_base = self.settings().get().api_url.clone();
        models::pull_model(&self.client, &api_base, name, cancel, on_progress).await?;
        if let Err(err) = self.refresh_models().await {
            warn!(error = %err, "Model pulled but the model list could not be refreshed");
        }
        Ok(())
    }

    fn resolve_target(&self) -> Result<TurnTarget, EngineError> {
        let settings = self.settings().get();
        let projects = self.projects().get();
        let project = projects.selected();

        let model = project
            .map(|project| project.model.trim())
            .filter(|model| !model.is_empty())
            .unwrap_or(settings.selected_model.trim());
        if model.is_empty() {
            return Err(EngineError::NoModelSelected);
        }
        Ok(TurnTarget {
            api_base: settings.api_url.clone(),
            model: model.to_string(),
            context_length: project.and_then(|project| project.context_length),
        })
    }

    fn ensure_active_conversation(&self) -> String {
        match self.conversations().get().active() {
            Some(conversation) => conversation.id.clone(),
            None => self.new_conversation(),
        }
    }

    fn begin_generation(
        &self,
        conversation_id: &str,
    ) -> Result<(CancellationController, InFlightGuard), EngineError> {
        let mut map = self.in_flight.lock();
        if map.contains_key(conversation_id) {
            return Err(EngineError::GenerationInFlight {
                conversation_id: conversation_id.to_string(),
            });
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let controller = CancellationController::new();
        map.insert(
            conversation_id.to_string(),
            InFlight {
                generation,
                controller: controller.clone(),
            },
        );
        Ok((
            controller,
            InFlightGuard {
                map: self.in_flight.clone(),
                conversation_id: conversation_id.to_string(),
                generation,
            },
        ))
    }
}
