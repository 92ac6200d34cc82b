use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bgfetch_engine::{
    Coordinator, CoordinatorConfig, DownloadOperation, DownloadRequest, HttpEngineConfig,
    HttpTransferEngine, parse_header, watch_termination_signals,
};
use clap::Parser;
use error::AppError;
use indicatif::MultiProgress;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod error;
mod utils;

use cli::CliArgs;
use utils::progress::ProgressManager;
use utils::{copy_to_output, create_dirs};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("bgfetch {} - coalescing background downloader", env!("CARGO_PKG_VERSION"));

    info!(
        "HTTP timeout configuration: overall={}s, connect={}s, read={}s",
        args.timeout, args.connect_timeout, args.read_timeout
    );

    let mut engine_config = HttpEngineConfig {
        timeout: Duration::from_secs(args.timeout),
        connect_timeout: Duration::from_secs(args.connect_timeout),
        read_timeout: Duration::from_secs(args.read_timeout),
        ..Default::default()
    };
    for line in &args.headers {
        let (name, value) = parse_header(line)?;
        info!(header = %name, "Adding header");
        engine_config.headers.insert(name, value);
    }
    let engine = Arc::new(HttpTransferEngine::new(engine_config)?);

    let mut builder = CoordinatorConfig::builder().with_purge_on_startup(!args.keep_cache);
    if let Some(dir) = &args.cache_dir {
        builder = builder.with_cache_dir(dir);
    }
    let coordinator = Coordinator::start(engine, builder.build()).await?;
    let _signals = watch_termination_signals(coordinator.clone());

    if let Some(dir) = &args.output_dir {
        create_dirs(dir).await?;
    }

    // Create a progress manager based on show_progress flag
    let multi = MultiProgress::new();
    let progress_manager = if args.show_progress {
        ProgressManager::new(multi)
    } else {
        ProgressManager::new_disabled(multi)
    };

    let mut operations = Vec::with_capacity(args.urls.len());
    for url in &args.urls {
        let request = DownloadRequest::parse(url)?;
        let label = request.url().to_string();
        let manager = progress_manager.clone();
        let operation = coordinator.perform(
            request,
            Vec::new(),
            progress_manager.observer(label.clone()),
            move |op| report(&manager, op, &label),
        );
        operations.push(operation);
    }

    let all_finished = futures::future::join_all(operations.iter().map(|op| op.wait()));
    tokio::select! {
        _ = all_finished => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Interrupted, cancelling downloads");
            for op in &operations {
                op.cancel();
            }
            futures::future::join_all(operations.iter().map(|op| op.wait())).await;
        }
    }

    let mut failed = 0;
    for op in &operations {
        match (op.result_file(), &args.output_dir) {
            (Some(cached), Some(dir)) => {
                let dest = copy_to_output(&cached, dir, op.request().url()).await?;
                info!(url = %op.request().url(), path = %dest.display(), "Saved");
            }
            (Some(cached), None) => {
                info!(url = %op.request().url(), path = %cached.display(), "Cached");
            }
            (None, _) => failed += 1,
        }
    }

    coordinator.shutdown();

    if failed > 0 {
        return Err(AppError::DownloadsFailed {
            failed,
            total: operations.len(),
        });
    }
    Ok(())
}

fn report(manager: &ProgressManager, op: &DownloadOperation, label: &str) {
    match (op.result_file(), op.error()) {
        (Some(path), _) => {
            info!(url = %label, "Download finished");
            manager.finish(op, format!("Finished {}", file_label(&path)));
        }
        (None, Some(e)) => {
            error!(url = %label, error = %e, "Download failed");
            manager.finish(op, format!("Failed {label}: {e}"));
        }
        (None, None) => manager.finish(op, format!("Stopped {label}")),
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
