//! Splat is the streaming chat core of a desktop client for a local,
//! Ollama-compatible inference server.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`api`] defines the wire payloads for chat, model listing and model pulls,
//!   plus the model management requests in [`api::models`].
//! - [`core`] owns the message model, NDJSON decoding, the conversation
//!   reducer, cancellation, the synchronized state containers and their
//!   persistence, the tool registry, and the [`core::engine::ChatEngine`] that
//!   drives a turn from user input to a finished reply.
//! - [`cli`] is a small command-line harness over the engine.
//! - [`utils`] holds URL joining and tracing setup.
//!
//! The binary (`src/main.rs`) routes straight into [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
