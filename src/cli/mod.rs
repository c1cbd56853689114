//! Command-line interface parsing and handling
//!
//! A thin harness over [`ChatEngine`]: every subcommand opens the persisted
//! stores, performs one operation, and flushes the stores before exiting.

pub mod conversations;
pub mod model_list;
pub mod say;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cli::conversations::{run_conversations, run_projects};
use crate::cli::model_list::{list_models, load_model, pull_model, unload_model};
use crate::cli::say::run_say;
use crate::core::config::Config;
use crate::core::engine::{ChatEngine, Stores};
use crate::core::persistence::{
    JsonFileStore, MemoryStore, Namespaced, PersistenceAdapter, PersistenceError,
};
use crate::core::sync::{BroadcastHub, SyncTransport};
use crate::core::tools::find_files::FindFilesTool;
use crate::core::tools::{Tool, ToolRegistry};
use crate::utils::logging::init_tracing;

/// Key prefix inside the shared store file.
pub const STORE_PREFIX: &str = "splat";

#[derive(Parser)]
#[command(name = "splat")]
#[command(about = "Chat with models served by a local Ollama-compatible server")]
#[command(
    long_about = "Splat streams chat replies from a local inference server, keeps \
conversations and projects in a persistent store, and lets models search the \
file system through a built-in tool.\n\n\
Configuration:\n\
  Use 'splat set <key> <value>' to change settings in config.toml.\n\
  Keys: api-url, max-tool-rounds, keep-alive-secs, tool-root, store-path\n\n\
Controls:\n\
  Ctrl+C            Stop the reply being generated (or cancel a pull)\n\n\
Logging:\n\
  RUST_LOG          Filter log output (defaults to splat=info)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long, global = true)]
    pub log: Option<PathBuf>,

    /// Keep state in memory only; nothing is read from or written to disk
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message in the active conversation and stream the reply
    Say {
        /// Model to use; also becomes the selected model
        #[arg(short = 'm', long)]
        model: Option<String>,
        /// Start a new conversation first
        #[arg(short = 'n', long)]
        new: bool,
        /// Attach a file (images are sent as images, anything else as text)
        #[arg(short = 'a', long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,
        /// Message text
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        prompt: Vec<String>,
    },
    /// List installed models and refresh the selection
    Models,
    /// Load a model into memory
    Load { model: String },
    /// Evict a model from memory
    Unload { model: String },
    /// Download a model
    Pull { model: String },
    /// List, show, switch, or delete conversations
    Conversations {
        #[command(subcommand)]
        command: Option<ConversationCommands>,
    },
    /// Manage projects (model, context length and system prompt presets)
    Projects {
        #[command(subcommand)]
        command: Option<ProjectCommands>,
    },
    /// Set configuration values, or print them when no value is given
    Set {
        /// Configuration key to set
        key: Option<String>,
        /// Value to set for the key
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset configuration values
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

#[derive(Subcommand)]
pub enum ConversationCommands {
    /// List conversations (default)
    List,
    /// Print the messages of a conversation (the active one by default)
    Show { id: Option<String> },
    /// Make a conversation active
    Switch { id: String },
    /// Delete a conversation
    Delete { id: String },
    /// Start a new, empty conversation
    New,
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// List projects (default)
    List,
    /// Add a project
    Add {
        name: String,
        /// Model the project uses instead of the selected model
        #[arg(short = 'm', long, default_value = "")]
        model: String,
        /// Context window passed to the model as num_ctx
        #[arg(short = 'c', long)]
        context_length: Option<u32>,
        /// System prompt stored at the start of new conversations
        #[arg(short = 's', long, default_value = "")]
        system_prompt: String,
        /// Select the project after adding it
        #[arg(long)]
        select: bool,
    },
    /// Remove a project
    Remove { id: String },
    /// Select a project
    Select { id: String },
    /// Clear the project selection
    Clear,
}

/// Stores, engine and background tasks for one CLI invocation.
pub struct Session {
    pub engine: ChatEngine,
    adapter: Arc<dyn PersistenceAdapter>,
    background: Vec<JoinHandle<()>>,
}

impl Session {
    pub async fn open(config: &Config, ephemeral: bool) -> Result<Self, Box<dyn Error>> {
        let adapter: Arc<dyn PersistenceAdapter> = if ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            let file_store = JsonFileStore::new(config.resolved_store_path()?);
            debug!(path = %file_store.path().display(), "Opening store");
            Arc::new(Namespaced::new(STORE_PREFIX, Arc::new(file_store)))
        };
        let transport: Arc<dyn SyncTransport> = BroadcastHub::new();

        let stores = Stores::load(adapter.as_ref(), transport).await;
        if config.api_url.is_some() && stores.settings.get().api_url != config.api_url() {
            let api_url = config.api_url().to_string();
            stores
                .settings
                .mutate(|settings| settings.with_api_url(api_url));
        }
        let background = stores.spawn_background(adapter.clone());

        let fallback: Arc<dyn Tool> = Arc::new(FindFilesTool::new(config.tool_root()));
        let engine = ChatEngine::new(
            reqwest::Client::new(),
            stores,
            ToolRegistry::new(fallback),
            config.engine_options(),
        );

        Ok(Self {
            engine,
            adapter,
            background,
        })
    }

    /// Write every store and stop the background tasks.
    pub async fn close(self) -> Result<(), PersistenceError> {
        let flushed = self.engine.stores().flush(self.adapter.as_ref()).await;
        for handle in self.background {
            handle.abort();
        }
        flushed
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref())?;
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    match args.command {
        Commands::Set { key, value } => {
            let mut config = Config::load()?;
            match key {
                Some(key) if !value.is_empty() => {
                    let value = value.join(" ");
                    config.set_key(&key, &value)?;
                    config.save()?;
                    println!("✅ Set {key} to: {value}");
                }
                _ => config.print_all(),
            }
            Ok(())
        }
        Commands::Unset { key } => {
            let mut config = Config::load()?;
            config.unset_key(&key)?;
            config.save()?;
            println!("✅ Unset {key}");
            Ok(())
        }
        command => {
            let config = Config::load()?;
            let session = Session::open(&config, args.ephemeral).await?;
            let result = dispatch(&session.engine, command).await;
            if let Err(err) = session.close().await {
                warn!(error = %err, "Failed to save state on exit");
                if result.is_ok() {
                    return Err(err.into());
                }
            }
            result
        }
    }
}

async fn dispatch(engine: &ChatEngine, command: Commands) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Say {
            model,
            new,
            attachments,
            prompt,
        } => run_say(engine, prompt, model, new, attachments).await,
        Commands::Models => list_models(engine).await,
        Commands::Load { model } => load_model(engine, &model).await,
        Commands::Unload { model } => unload_model(engine, &model).await,
        Commands::Pull { model } => pull_model(engine, &model).await,
        Commands::Conversations { command } => {
            run_conversations(engine, command.unwrap_or(ConversationCommands::List))
        }
        Commands::Projects { command } => {
            run_projects(engine, command.unwrap_or(ProjectCommands::List))
        }
        Commands::Set { .. } | Commands::Unset { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests;
