pub mod config;
pub mod conversation;
pub mod diff_bus;
pub mod error;
pub mod events;
pub mod file_resolver;
pub mod file_store;
pub mod markers;
pub mod merge;
pub mod models;
pub mod orchestrator;
pub mod protocol;
pub mod stream_decoder;
pub mod tool_loop;
pub mod tool_service;

pub use error::{EngineError, Result};
pub use orchestrator::{CancelHandle, Orchestrator};
