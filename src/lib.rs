//! Cerebro runner
//!
//! A worker process driven over stdin/stdout with one JSON object per line.
//! It downloads model repositories from a Hugging Face compatible hub with
//! resumable transfers, and streams chat generations from a single resident
//! model.
//!
//! Module structure:
//! - config.rs: RunnerConfig read from the environment
//! - error.rs: typed errors for every layer
//! - protocol/: command parsing and event emission
//! - registry.rs: active jobs and their cancellation tokens
//! - download/: manifests, resumable transfers, progress
//! - generation/: inference engine, model slot, conversation history
//! - dispatcher.rs: the command loop

pub mod config;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod generation;
pub mod protocol;
pub mod registry;

pub use config::RunnerConfig;
pub use dispatcher::{Dispatcher, ExitReason};
pub use protocol::{Event, EventEmitter};
