//! Repository download job: manifest, per-file transfers, aggregate progress

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::progress::ProgressReporter;
use super::transfer::{safe_join, transfer_file, FileRequest};
use super::types::{aggregate_total, ModelRegistry, Transport};
use crate::config::RunnerConfig;
use crate::error::{DownloadError, TransferError};
use crate::protocol::{DownloadCommand, Event, EventEmitter};

/// Runs download jobs. Holds no per-download state between calls.
#[derive(Clone)]
pub struct DownloadManager {
    registry: Arc<dyn ModelRegistry>,
    transport: Arc<dyn Transport>,
    models_dir: PathBuf,
    default_token: Option<String>,
}

impl DownloadManager {
    pub fn new(
        registry: Arc<dyn ModelRegistry>,
        transport: Arc<dyn Transport>,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            models_dir: config.models_dir.clone(),
            default_token: config.default_token.clone(),
        }
    }

    /// Run one download to completion. Progress goes to `emitter`; the
    /// terminal event is returned so the caller can release the job first.
    pub async fn run(&self, cmd: &DownloadCommand, cancel: &CancellationToken, emitter: &EventEmitter) -> Event {
        log::info!("Starting download: {} for repo: {}", cmd.download_id, cmd.repo_id);

        match self.download(cmd, cancel, emitter).await {
            Ok(path) => {
                log::info!("Download done: {} for repo: {}", cmd.download_id, cmd.repo_id);
                Event::DownloadDone {
                    download_id: cmd.download_id.clone(),
                    repo_id: cmd.repo_id.clone(),
                    path: path.to_string_lossy().to_string(),
                }
            }
            Err(e) => {
                match e {
                    DownloadError::Cancelled => {
                        log::info!("Download cancelled: {} for repo: {}", cmd.download_id, cmd.repo_id)
                    }
                    _ => log::error!(
                        "Download error: {} for repo: {}: {}",
                        cmd.download_id,
                        cmd.repo_id,
                        e
                    ),
                }
                Event::download_error(Some(&cmd.download_id), Some(&cmd.repo_id), e.to_string())
            }
        }
    }

    /// Where the repository's files go: the command's local_dir, else a
    /// folder under the models directory named after the repo
    fn destination(&self, cmd: &DownloadCommand) -> Result<PathBuf, TransferError> {
        if let Some(dir) = &cmd.local_dir {
            return Ok(dir.clone());
        }
        if self.models_dir.as_os_str().is_empty() {
            return Err(TransferError::MissingDestination);
        }
        safe_join(&self.models_dir, &cmd.repo_id)
    }

    async fn download(
        &self,
        cmd: &DownloadCommand,
        cancel: &CancellationToken,
        emitter: &EventEmitter,
    ) -> Result<PathBuf, DownloadError> {
        emitter.emit(Event::DownloadStarted {
            download_id: cmd.download_id.clone(),
            repo_id: cmd.repo_id.clone(),
        });

        let dest_dir = self.destination(cmd)?;
        let token = cmd.token.as_deref().or(self.default_token.as_deref());

        let files = self
            .registry
            .list_files(&cmd.repo_id, cmd.revision.as_deref(), token)
            .await?;
        if files.is_empty() {
            return Err(TransferError::EmptyManifest.into());
        }

        let total = aggregate_total(&files);
        log::info!(
            "Repo {} has {} files, total {}",
            cmd.repo_id,
            files.len(),
            total.map(|t| format!("{} bytes", t)).unwrap_or_else(|| "unknown".to_string())
        );

        let mut progress = ProgressReporter::new(emitter.clone(), &cmd.download_id, &cmd.repo_id, total);
        progress.report(0, Some("Starting download"));

        let mut downloaded: u64 = 0;
        for file in &files {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            progress.report(downloaded, Some(&file.filename));

            let dest = safe_join(&dest_dir, &file.filename)?;
            let url = self
                .registry
                .resolve_download_url(&cmd.repo_id, &file.filename, cmd.revision.as_deref());

            let base = downloaded;
            let expected = file.size;
            let written = transfer_file(
                self.transport.as_ref(),
                FileRequest {
                    url: &url,
                    dest: &dest,
                    expected_size: expected,
                    token,
                    cancel,
                },
                |n| {
                    let in_file = expected.map_or(n, |size| n.min(size));
                    progress.report(base + in_file, Some(&file.filename));
                },
            )
            .await?;

            // Advance by the declared size when known so the final count matches the total exactly
            downloaded = base + expected.unwrap_or(written);
            progress.report(downloaded, Some(&file.filename));
        }

        Ok(dest_dir)
    }
}
