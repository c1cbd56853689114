pub mod cancellation;
pub mod chat_stream;
pub mod config;
pub mod engine;
pub mod message;
pub mod persistence;
pub mod reducer;
pub mod state;
pub mod store;
pub mod sync;
pub mod tools;
