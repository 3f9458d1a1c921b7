//! Repository downloads
//!
//! Module structure:
//! - types.rs: FileEntry, ModelRegistry and Transport traits
//! - hub.rs: HubClient, the HTTP implementation of both traits
//! - transfer.rs: resumable single-file transfer
//! - progress.rs: throttling and aggregate progress reporting
//! - manager.rs: DownloadManager, one repository per job

pub mod hub;
pub mod manager;
pub mod progress;
pub mod transfer;
pub mod types;

pub use hub::HubClient;
pub use manager::DownloadManager;
pub use types::{aggregate_total, FileEntry, ModelRegistry, Transport, TransportResponse};
