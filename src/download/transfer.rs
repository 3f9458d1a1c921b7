//! Resumable single-file transfer

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::progress::ProgressThrottle;
use super::types::Transport;
use crate::error::{DownloadError, TransferError};

/// Everything needed to fetch one file
pub struct FileRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected_size: Option<u64>,
    pub token: Option<&'a str>,
    pub cancel: &'a CancellationToken,
}

/// Join a manifest filename onto the destination, refusing anything that
/// would escape it
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf, TransferError> {
    let mut path = base.to_path_buf();
    let mut pushed = false;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return Err(TransferError::UnsafePath(relative.to_string())),
        }
    }
    if !pushed {
        return Err(TransferError::UnsafePath(relative.to_string()));
    }
    Ok(path)
}

async fn local_size(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Download one file into `request.dest`, resuming from what is already on
/// disk when possible.
///
/// `on_progress` receives the number of bytes of this file present on disk,
/// throttled, and once more at the end. Returns the final on-disk size.
pub async fn transfer_file<F>(
    transport: &dyn Transport,
    request: FileRequest<'_>,
    mut on_progress: F,
) -> Result<u64, DownloadError>
where
    F: FnMut(u64),
{
    let dest = request.dest;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut existing = local_size(dest).await;

    if let Some(expected) = request.expected_size {
        if existing == expected {
            log::info!("Already complete, skipping: {}", dest.display());
            return Ok(existing);
        }
        if existing > expected {
            log::warn!(
                "Local file larger than expected ({} > {}), restarting: {}",
                existing,
                expected,
                dest.display()
            );
            fs::remove_file(dest).await?;
            existing = 0;
        }
    }

    let range_start = (existing > 0).then_some(existing);
    let mut response = transport.get(request.url, range_start, request.token).await?;

    if existing > 0 && !response.is_partial_content() {
        log::warn!(
            "Server ignored range request (status {}), restarting from zero: {}",
            response.status,
            dest.display()
        );
        drop(response);
        existing = 0;
        response = transport.get(request.url, None, request.token).await?;
    }

    if response.status >= 400 {
        let status = response.status;
        let body = response.body_snippet(200).await;
        return Err(TransferError::Http { status, body }.into());
    }

    let mut file = if existing > 0 {
        log::info!("Resuming {} from byte {}", dest.display(), existing);
        fs::OpenOptions::new().append(true).open(dest).await?
    } else {
        fs::File::create(dest).await?
    };

    let mut written = existing;
    let mut throttle = ProgressThrottle::new(existing);

    while let Some(chunk) = response.body.next().await {
        if request.cancel.is_cancelled() {
            // Keep the partial file for a later resume
            file.flush().await?;
            return Err(DownloadError::Cancelled);
        }
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                // Whatever arrived stays on disk for a later resume
                file.flush().await?;
                return Err(e.into());
            }
        };
        if chunk.is_empty() {
            continue;
        }
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        if throttle.should_emit(written, Instant::now()) {
            on_progress(written);
        }
    }

    file.flush().await?;
    on_progress(written);
    Ok(written)
}


#[cfg(test)]
mod tests {
    use super::test_support::StubTransport;
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fresh_download_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/model.bin");
        let transport = StubTransport::new(payload(100), vec![40, 40, 20]);
        let cancel = CancellationToken::new();

        let mut reported = Vec::new();
        let written = transfer_file(
            &transport,
            FileRequest {
                url: "http://x/model.bin",
                dest: &dest,
                expected_size: Some(100),
                token: None,
                cancel: &cancel,
            },
            |n| reported.push(n),
        )
        .await
        .unwrap();

        assert_eq!(written, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(100));
        assert_eq!(reported.first(), Some(&40));
        assert_eq!(reported.last(), Some(&100));
        assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(transport.requests(), vec![("http://x/model.bin".to_string(), None)]);
    }

    #[tokio::test]
    async fn test_resume_sends_range_from_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.bin");
        let body = payload(100);
        std::fs::write(&dest, &body[..30]).unwrap();

        let transport = StubTransport::new(body.clone(), vec![25]);
        let cancel = CancellationToken::new();
        let written = transfer_file(
            &transport,
            FileRequest {
                url: "u",
                dest: &dest,
                expected_size: Some(100),
                token: None,
                cancel: &cancel,
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(written, 100);
        assert_eq!(transport.requests(), vec![("u".to_string(), Some(30))]);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_complete_file_is_skipped_without_request() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("done.bin");
        std::fs::write(&dest, payload(100)).unwrap();

        let transport = StubTransport::new(payload(100), vec![10]);
        let cancel = CancellationToken::new();
        let written = transfer_file(
            &transport,
            FileRequest {
                url: "u",
                dest: &dest,
                expected_size: Some(100),
                token: None,
                cancel: &cancel,
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(written, 100);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_local_file_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.bin");
        std::fs::write(&dest, payload(150)).unwrap();

        let transport = StubTransport::new(payload(100), vec![50]);
        let cancel = CancellationToken::new();
        transfer_file(
            &transport,
            FileRequest {
                url: "u",
                dest: &dest,
                expected_size: Some(100),
                token: None,
                cancel: &cancel,
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(transport.requests(), vec![("u".to_string(), None)]);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(100));
    }

    #[tokio::test]
    async fn test_ignored_range_falls_back_to_full_request() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.bin");
        std::fs::write(&dest, b"stale-prefix").unwrap();

        let mut transport = StubTransport::new(payload(64), vec![16]);
        transport.honor_range = false;
        let cancel = CancellationToken::new();
        let written = transfer_file(
            &transport,
            FileRequest {
                url: "u",
                dest: &dest,
                expected_size: None,
                token: None,
                cancel: &cancel,
            },
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(written, 64);
        assert_eq!(
            transport.requests(),
            vec![("u".to_string(), Some(12)), ("u".to_string(), None)]
        );
        assert_eq!(std::fs::read(&dest).unwrap(), payload(64));
    }

    #[tokio::test]
    async fn test_http_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.bin");
        let mut transport = StubTransport::new(b"Entry not found".to_vec(), vec![64]);
        transport.status = 404;
        let cancel = CancellationToken::new();

        let err = transfer_file(
            &transport,
            FileRequest {
                url: "u",
                dest: &dest,
                expected_size: Some(10),
                token: None,
                cancel: &cancel,
            },
            |_| {},
        )
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "HTTP error downloading file: HTTP 404: Entry not found"
        );
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.bin");
        let cancel = CancellationToken::new();
        let mut transport = StubTransport::new(payload(100), vec![10]);
        transport.cancel_after = Some((3, cancel.clone()));

        let err = transfer_file(
            &transport,
            FileRequest {
                url: "u",
                dest: &dest,
                expected_size: Some(100),
                token: None,
                cancel: &cancel,
            },
            |_| {},
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        let partial = std::fs::metadata(&dest).unwrap().len();
        assert_eq!(partial, 30);
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_partial_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.bin");
        let cancel = CancellationToken::new();
        let request = || FileRequest {
            url: "u",
            dest: &dest,
            expected_size: Some(100),
            token: None,
            cancel: &cancel,
        };

        let mut flaky = StubTransport::new(payload(100), vec![10]);
        flaky.fail_at = Some(4);
        let err = transfer_file(&flaky, request(), |_| {}).await.unwrap_err();

        assert_eq!(err.to_string(), "Network error downloading file: connection reset");
        assert_eq!(std::fs::read(&dest).unwrap(), payload(40));

        let transport = StubTransport::new(payload(100), vec![10]);
        let written = transfer_file(&transport, request(), |_| {}).await.unwrap();

        assert_eq!(written, 100);
        assert_eq!(transport.requests(), vec![("u".to_string(), Some(40))]);
        assert_eq!(std::fs::read(&dest).unwrap(), payload(100));
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let base = Path::new("/data/models");
        assert_eq!(
            safe_join(base, "sub/./file.bin").unwrap(),
            PathBuf::from("/data/models/sub/file.bin")
        );
        assert!(safe_join(base, "../etc/passwd").is_err());
        assert!(safe_join(base, "/abs").is_err());
        assert!(safe_join(base, "").is_err());
    }
}
