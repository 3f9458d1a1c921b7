//! Progress throttling and aggregate reporting for download jobs

use std::time::{Duration, Instant};

use crate::protocol::{Event, EventEmitter};

/// Emit at most once per this many bytes...
pub const PROGRESS_BYTES: u64 = 1024 * 1024;
/// ...or once per this interval, whichever comes first
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Decides when a per-file byte count is worth reporting
#[derive(Debug)]
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    last_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(start_bytes: u64) -> Self {
        Self {
            last_emit: None,
            last_bytes: start_bytes,
        }
    }

    pub fn should_emit(&mut self, bytes: u64, now: Instant) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                bytes.saturating_sub(self.last_bytes) >= PROGRESS_BYTES
                    || now.duration_since(last) >= PROGRESS_INTERVAL
            }
        };
        if due {
            self.last_emit = Some(now);
            self.last_bytes = bytes;
        }
        due
    }
}

/// Emits `download_progress` for one job, keeping `n` monotonic and within
/// the declared total
pub struct ProgressReporter {
    emitter: EventEmitter,
    download_id: String,
    repo_id: String,
    total: Option<u64>,
    last_n: u64,
}

impl ProgressReporter {
    pub fn new(
        emitter: EventEmitter,
        download_id: impl Into<String>,
        repo_id: impl Into<String>,
        total: Option<u64>,
    ) -> Self {
        Self {
            emitter,
            download_id: download_id.into(),
            repo_id: repo_id.into(),
            total,
            last_n: 0,
        }
    }

    pub fn report(&mut self, n: u64, desc: Option<&str>) {
        let mut n = n.max(self.last_n);
        if let Some(total) = self.total {
            n = n.min(total);
        }
        self.last_n = n;
        self.emitter.emit(Event::DownloadProgress {
            download_id: self.download_id.clone(),
            repo_id: self.repo_id.clone(),
            n,
            total: self.total,
            desc: desc.map(str::to_string),
        });
    }
}
