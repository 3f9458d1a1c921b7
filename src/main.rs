//! Runner binary
//!
//! stdout carries protocol events only; all logging goes to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::BufReader;

use cerebro_runner::download::{DownloadManager, HubClient};
use cerebro_runner::generation::{GenerationOrchestrator, MistralEngine};
use cerebro_runner::{Dispatcher, EventEmitter, RunnerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics to stderr before exiting
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Cerebro runner PANIC: {}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!("  at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cerebro_runner=info".parse()?)
                .add_directive("mistralrs=info".parse()?)
                .add_directive("mistralrs_core=info".parse()?)
                .add_directive("candle=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = RunnerConfig::from_env();
    log::info!(
        "Cerebro runner starting (models dir: {}, hub: {})",
        config.models_dir.display(),
        config.hub_endpoint
    );

    let hub = Arc::new(HubClient::new(&config).context("Failed to build HTTP client")?);
    let downloads = DownloadManager::new(hub.clone(), hub, &config);
    let engine = Arc::new(MistralEngine::new(&config));
    let generator = Arc::new(GenerationOrchestrator::new(engine, &config));

    let dispatcher = Dispatcher::new(downloads, generator, EventEmitter::stdout(), &config);
    let exit = dispatcher.run(BufReader::new(tokio::io::stdin())).await;

    log::info!("Cerebro runner exiting ({:?})", exit);
    Ok(())
}
