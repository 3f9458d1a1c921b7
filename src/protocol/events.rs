//! Outgoing events and the emitter that writes them as JSON lines

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One line of output to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Ready,
    DownloadStarted {
        download_id: String,
        repo_id: String,
    },
    DownloadProgress {
        download_id: String,
        repo_id: String,
        n: u64,
        total: Option<u64>,
        desc: Option<String>,
    },
    DownloadDone {
        download_id: String,
        repo_id: String,
        path: String,
    },
    DownloadError {
        download_id: Option<String>,
        repo_id: Option<String>,
        message: String,
    },
    ChatToken {
        generation_id: String,
        token: String,
    },
    Done {
        generation_id: String,
    },
    Error {
        generation_id: Option<String>,
        message: String,
    },
    Shutdown,
}

impl Event {
    pub fn error(generation_id: Option<&str>, message: impl Into<String>) -> Self {
        Event::Error {
            generation_id: generation_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn download_error(
        download_id: Option<&str>,
        repo_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Event::DownloadError {
            download_id: download_id.map(str::to_string),
            repo_id: repo_id.map(str::to_string),
            message: message.into(),
        }
    }

    /// True for events that end a job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::DownloadDone { .. }
                | Event::DownloadError { .. }
                | Event::Done { .. }
                | Event::Error { .. }
        )
    }
}

enum Sink {
    Writer(Mutex<Box<dyn Write + Send>>),
    Channel(mpsc::UnboundedSender<Event>),
}

/// Serializes events to the output stream.
///
/// Cloning is cheap; all clones share one sink, and each event is written and
/// flushed as a whole line under the sink lock so concurrent jobs never
/// interleave partial lines.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<Sink>,
}

impl EventEmitter {
    /// Emitter writing to process stdout
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    pub fn from_writer<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            sink: Arc::new(Sink::Writer(Mutex::new(Box::new(writer)))),
        }
    }

    /// Emitter delivering typed events to a channel instead of a byte stream
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sink: Arc::new(Sink::Channel(tx)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: Event) {
        match self.sink.as_ref() {
            Sink::Writer(writer) => {
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        log::error!("Failed to serialize event {:?}: {}", event, e);
                        return;
                    }
                };
                let mut handle = match writer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Err(e) = writeln!(handle, "{}", line).and_then(|_| handle.flush()) {
                    log::error!("Failed to write event: {}", e);
                }
            }
            Sink::Channel(tx) => {
                if tx.send(event).is_err() {
                    log::debug!("Event receiver dropped");
                }
            }
        }
    }
}
