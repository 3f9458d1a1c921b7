//! Download types and collaborator traits

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// One file listed in a repository manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the repository root
    pub filename: String,
    /// Expected size in bytes, when the registry reports one
    pub size: Option<u64>,
}

impl FileEntry {
    pub fn new(filename: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            filename: filename.into(),
            size: size.filter(|s| *s > 0),
        }
    }
}

/// Overall byte total for a manifest.
///
/// Only reported when every file size is known; a partial sum would look
/// like a real total to the UI.
pub fn aggregate_total(files: &[FileEntry]) -> Option<u64> {
    let mut total: u64 = 0;
    for file in files {
        total = total.checked_add(file.size?)?;
    }
    (total > 0).then_some(total)
}

/// Source of repository metadata
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// List every file of a repository with its size when known
    async fn list_files(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        token: Option<&str>,
    ) -> Result<Vec<FileEntry>, TransferError>;

    /// URL serving the raw content of one file
    fn resolve_download_url(&self, repo_id: &str, filename: &str, revision: Option<&str>) -> String;
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Status line plus body stream of a GET
pub struct TransportResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn is_partial_content(&self) -> bool {
        self.status == 206
    }

    /// Read up to `limit` bytes of the body for an error message
    pub async fn body_snippet(mut self, limit: usize) -> String {
        let mut collected = Vec::new();
        while collected.len() < limit {
            match self.body.next().await {
                Some(Ok(chunk)) => collected.extend_from_slice(&chunk),
                _ => break,
            }
        }
        collected.truncate(limit);
        String::from_utf8_lossy(&collected).into_owned()
    }
}

/// Byte transport used for file content
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET, asking for bytes from `range_start` onwards when given
    async fn get(
        &self,
        url: &str,
        range_start: Option<u64>,
        token: Option<&str>,
    ) -> Result<TransportResponse, TransferError>;
}
