//! Line-delimited JSON protocol spoken with the host over stdin/stdout
//!
//! - commands.rs: incoming command parsing and validation
//! - events.rs: outgoing events and the emitter

pub mod commands;
pub mod events;

pub use commands::{Command, DownloadCommand, GenerateCommand, Rejection};
pub use events::{Event, EventEmitter};
