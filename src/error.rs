//! Error types for runner operations
//!
//! The `Display` text of each error is what ends up in the `message` field of
//! the terminal event the host receives.

use thiserror::Error;

/// Problems with a command line itself. Reported without starting a job.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("Unknown type: {0}")]
    UnknownType(String),
    #[error("Missing {0}")]
    MissingField(&'static str),
    #[error("Invalid {0}")]
    InvalidField(&'static str),
    #[error("Job already running: {0}")]
    DuplicateJob(String),
}

/// Failure while transferring repository files
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP error downloading file: {}", http_detail(*status, body))]
    Http { status: u16, body: String },
    #[error("Network error downloading file: {0}")]
    Network(String),
    #[error("Failed to fetch repository manifest: {0}")]
    Manifest(String),
    #[error("No files found in repo")]
    EmptyManifest,
    #[error("Missing local_dir")]
    MissingDestination,
    #[error("Refusing to write outside local_dir: {0}")]
    UnsafePath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn http_detail(status: u16, body: &str) -> String {
    let snippet: String = body.trim().chars().take(200).collect();
    if snippet.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, snippet)
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        TransferError::Network(e.to_string())
    }
}

/// Terminal outcome of a download job that did not finish
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Download cancelled")]
    Cancelled,
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl From<std::io::Error> for DownloadError {
    fn from(e: std::io::Error) -> Self {
        DownloadError::Transfer(TransferError::Io(e))
    }
}

/// Failure reported by the inference backend
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Template strategy not supported by this model")]
    UnsupportedTemplate,
    #[error("Failed to render chat template: {0}")]
    Render(String),
    #[error("Generation failed: {0}")]
    Generation(String),
    #[error("Generation worker panicked")]
    WorkerPanicked,
}

/// Terminal outcome of a generation job that did not finish
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Inference(#[from] InferenceError),
}
