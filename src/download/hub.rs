//! Hub HTTP client: repository manifests and file transport over reqwest

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, RANGE, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;

use super::types::{FileEntry, ModelRegistry, Transport, TransportResponse};
use crate::config::RunnerConfig;
use crate::error::TransferError;

const RUNNER_USER_AGENT: &str = concat!("cerebro-runner/", env!("CARGO_PKG_VERSION"), " (tauri; rust)");
const DEFAULT_REVISION: &str = "main";

#[derive(Debug, Deserialize)]
struct ModelInfoResponse {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    #[serde(default)]
    size: Option<u64>,
}

impl Sibling {
    /// Plain size first, then the LFS blob size
    fn expected_size(&self) -> Option<u64> {
        self.size
            .filter(|s| *s > 0)
            .or_else(|| self.lfs.as_ref().and_then(|l| l.size).filter(|s| *s > 0))
    }
}

fn manifest_from_info(info: ModelInfoResponse) -> Vec<FileEntry> {
    info.siblings
        .into_iter()
        .filter_map(|s| {
            let size = s.expected_size();
            s.rfilename
                .filter(|name| !name.is_empty())
                .map(|name| FileEntry::new(name, size))
        })
        .collect()
}

/// Client for a Hugging Face Hub compatible endpoint
#[derive(Clone)]
pub struct HubClient {
    client: Client,
    endpoint: String,
}

impl HubClient {
    pub fn new(config: &RunnerConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.hub_endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn model_info_url(&self, repo_id: &str, revision: Option<&str>) -> String {
        match revision {
            Some(rev) => format!(
                "{}/api/models/{}/revision/{}?blobs=true",
                self.endpoint,
                repo_id,
                encode_revision(rev)
            ),
            None => format!("{}/api/models/{}?blobs=true", self.endpoint, repo_id),
        }
    }
}

/// Revisions like `refs/pr/1` must stay a single path segment
fn encode_revision(revision: &str) -> String {
    revision.replace('/', "%2F")
}

#[async_trait]
impl ModelRegistry for HubClient {
    async fn list_files(
        &self,
        repo_id: &str,
        revision: Option<&str>,
        token: Option<&str>,
    ) -> Result<Vec<FileEntry>, TransferError> {
        let url = self.model_info_url(repo_id, revision);
        log::debug!("Fetching manifest: {}", url);

        let mut request = self.client.get(&url).header(USER_AGENT, RUNNER_USER_AGENT);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Manifest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.trim().chars().take(200).collect();
            return Err(TransferError::Manifest(format!("HTTP {}: {}", status.as_u16(), snippet)));
        }

        let info: ModelInfoResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Manifest(format!("Invalid model info: {}", e)))?;

        Ok(manifest_from_info(info))
    }

    fn resolve_download_url(&self, repo_id: &str, filename: &str, revision: Option<&str>) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint,
            repo_id,
            encode_revision(revision.unwrap_or(DEFAULT_REVISION)),
            filename
        )
    }
}

#[async_trait]
impl Transport for HubClient {
    async fn get(
        &self,
        url: &str,
        range_start: Option<u64>,
        token: Option<&str>,
    ) -> Result<TransportResponse, TransferError> {
        // Avoid transparent decompression changing byte counts
        let mut request = self
            .client
            .get(url)
            .header(ACCEPT_ENCODING, "identity")
            .header(USER_AGENT, RUNNER_USER_AGENT);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(start) = range_start {
            request = request.header(RANGE, format!("bytes={}-", start));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferError::from))
            .boxed();

        Ok(TransportResponse { status, body })
    }
}
