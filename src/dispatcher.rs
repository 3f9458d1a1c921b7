//! Command dispatcher: reads JSON lines, routes them to job tasks, and
//! drains in-flight work on shutdown or end of input

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::download::DownloadManager;
use crate::error::ProtocolError;
use crate::generation::{GenerationOrchestrator, InferenceEngine};
use crate::protocol::{Command, DownloadCommand, Event, EventEmitter, GenerateCommand};
use crate::registry::{JobKind, JobRegistry};

/// Why the dispatch loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    EndOfInput,
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct Dispatcher<E: InferenceEngine> {
    jobs: JobRegistry,
    downloads: DownloadManager,
    generator: Arc<GenerationOrchestrator<E>>,
    emitter: EventEmitter,
    shutdown_grace: Duration,
    tasks: JoinSet<()>,
}

impl<E: InferenceEngine> Dispatcher<E> {
    pub fn new(
        downloads: DownloadManager,
        generator: Arc<GenerationOrchestrator<E>>,
        emitter: EventEmitter,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            jobs: JobRegistry::new(),
            downloads,
            generator,
            emitter,
            shutdown_grace: config.shutdown_grace,
            tasks: JoinSet::new(),
        }
    }

    /// Emit `ready`, then process commands until `shutdown` or end of input
    pub async fn run<R>(mut self, input: R) -> ExitReason
    where
        R: AsyncBufRead + Unpin,
    {
        self.emitter.emit(Event::Ready);
        log::info!("Runner ready");

        let mut lines = input.lines();
        loop {
            tokio::select! {
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = result {
                        log::error!("Job task failed: {}", e);
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Flow::Shutdown = self.handle_line(&line) {
                            log::info!("Shutdown requested");
                            self.drain().await;
                            self.emitter.emit(Event::Shutdown);
                            return ExitReason::Shutdown;
                        }
                    }
                    Ok(None) => {
                        log::info!("Input closed");
                        self.drain().await;
                        return ExitReason::EndOfInput;
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        log::warn!("Skipping unreadable input line: {}", e);
                        self.emitter.emit(Event::error(None, ProtocolError::InvalidJson.to_string()));
                    }
                    Err(e) => {
                        log::error!("Failed to read input: {}", e);
                        self.drain().await;
                        return ExitReason::EndOfInput;
                    }
                },
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Flow {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }

        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(rejection) => {
                log::warn!("Rejected command: {}", rejection.error());
                self.emitter.emit(rejection.into_event());
                return Flow::Continue;
            }
        };

        match command {
            Command::Shutdown => return Flow::Shutdown,
            Command::Cancel { generation_id } => match generation_id {
                Some(id) => {
                    self.jobs.cancel(JobKind::Generation, &id);
                }
                None => log::debug!("cancel without generation_id ignored"),
            },
            Command::DownloadCancel { download_id } => match download_id {
                Some(id) => {
                    self.jobs.cancel(JobKind::Download, &id);
                }
                None => log::debug!("download_cancel without download_id ignored"),
            },
            Command::Download(cmd) => self.start_download(cmd),
            Command::Generate(cmd) => self.start_generation(cmd),
        }
        Flow::Continue
    }

    fn start_download(&mut self, cmd: DownloadCommand) {
        let guard = match self
            .jobs
            .register(JobKind::Download, &cmd.download_id, CancellationToken::new())
        {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Rejected download {}: {}", cmd.download_id, e);
                self.emitter.emit(Event::download_error(
                    Some(&cmd.download_id),
                    Some(&cmd.repo_id),
                    e.to_string(),
                ));
                return;
            }
        };

        let downloads = self.downloads.clone();
        let emitter = self.emitter.clone();
        self.tasks.spawn(async move {
            let terminal = downloads.run(&cmd, guard.token(), &emitter).await;
            drop(guard);
            emitter.emit(terminal);
        });
    }

    fn start_generation(&mut self, cmd: GenerateCommand) {
        let guard = match self
            .jobs
            .register(JobKind::Generation, &cmd.generation_id, CancellationToken::new())
        {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Rejected generation {}: {}", cmd.generation_id, e);
                self.emitter.emit(Event::error(Some(&cmd.generation_id), e.to_string()));
                return;
            }
        };

        let generator = self.generator.clone();
        let emitter = self.emitter.clone();
        self.tasks.spawn(async move {
            let terminal = generator.run(&cmd, guard.token(), &emitter).await;
            drop(guard);
            emitter.emit(terminal);
        });
    }

    /// Cancel every job and give the tasks a bounded time to emit their
    /// terminal events
    async fn drain(&mut self) {
        let cancelled = self.jobs.cancel_all();
        if self.tasks.is_empty() {
            return;
        }
        log::info!(
            "Waiting for {} job(s) to finish ({} cancelled)",
            self.tasks.len(),
            cancelled
        );

        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    log::error!("Job task failed: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !finished {
            log::warn!(
                "{} job(s) still running after {:?}, aborting",
                self.tasks.len(),
                self.shutdown_grace
            );
            self.tasks.abort_all();
        }
    }
}
