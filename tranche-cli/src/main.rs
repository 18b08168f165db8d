mod checksum;
mod cli;
mod error;
mod progress;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio::sync::watch;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use tranche::{
    DownloadEngine, DownloadInfo, EngineConfig, FixedNetwork, LocalFileSystem, MemoryRepository,
    ProxyConfig, Repository, StatusCode,
};

use crate::cli::Args;
use crate::error::{AppError, Result};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const FALLBACK_FILE_NAME: &str = "download";
const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(()) => {}
        Err(AppError::Interrupted) => {
            eprintln!("{}", AppError::Interrupted);
            process::exit(130);
        }
        Err(e) => {
            error!("Application error: {e}");
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = build_config(&args);
    let file_name = match &args.name {
        Some(name) => name.clone(),
        None => file_name_from_url(&args.url),
    };

    let mut download = DownloadInfo::new(&args.url, &args.output_dir, &file_name)
        .with_num_pieces(args.pieces);
    download.user_agent = args.user_agent.clone();
    if let Some(sha256) = &args.sha256 {
        download = download.with_checksum(sha256.trim().to_ascii_lowercase());
    }
    let id = download.id;

    let repository = Arc::new(MemoryRepository::new());
    let engine = Arc::new(DownloadEngine::new(
        repository.clone(),
        Arc::new(LocalFileSystem::new()),
        Arc::new(FixedNetwork::default()),
        config,
    ));
    engine.add(&download).await?;

    let (interrupt_tx, mut interrupted) = watch::channel(false);
    let signal_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, pausing");
            let _ = interrupt_tx.send(true);
            signal_engine.pause(id);
        }
    });

    let (pb, refresher) = progress::spawn(engine.repository().clone(), id, file_name.clone());
    let outcome = drive(&engine, id, &mut interrupted).await;
    refresher.abort();

    let finished = repository.get_info(id).await?;
    match &outcome {
        Ok(()) => pb.finish_with_message("done"),
        Err(e) => pb.abandon_with_message(e.to_string()),
    }
    outcome?;

    let Some(finished) = finished else {
        return Err(AppError::InvalidInput(format!("download {id} vanished")));
    };
    if let Some(expected) = finished.checksum.as_deref() {
        checksum::verify_file(finished.file_path(), expected.to_owned()).await?;
        info!("Checksum verified");
    }

    if args.json {
        let json = serde_json::to_string_pretty(&finished)
            .map_err(|e| AppError::InvalidInput(e.to_string()))?;
        println!("{json}");
    } else {
        println!("{}", finished.file_path().display());
    }
    Ok(())
}

/// Runs attempts until the download reaches a terminal status.
async fn drive(
    engine: &DownloadEngine,
    id: uuid::Uuid,
    interrupted: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        engine.start(id);
        let result = engine.wait(id).await?;
        debug!(status = %result.status, outcome = ?result.outcome, "Attempt finished");

        if result.status != StatusCode::Success && *interrupted.borrow() {
            return Err(AppError::Interrupted);
        }

        let delay = match result.status {
            StatusCode::Success => return Ok(()),
            StatusCode::WaitingToRetry => result
                .retry_after
                .unwrap_or_else(|| engine.config().retry.base_delay),
            StatusCode::WaitingForNetwork => NETWORK_POLL_INTERVAL,
            status => {
                let message = engine
                    .repository()
                    .get_info(id)
                    .await?
                    .and_then(|info| info.status_msg)
                    .unwrap_or_else(|| status.as_str().to_owned());
                return Err(AppError::Failed { status, message });
            }
        };

        warn!(status = %result.status, delay_secs = delay.as_secs(), "Waiting before next attempt");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            Ok(()) = interrupted.changed() => return Err(AppError::Interrupted),
        }
    }
}

fn build_config(args: &Args) -> EngineConfig {
    let mut builder = EngineConfig::builder()
        .with_max_retries(args.retries)
        .with_delete_file_on_error(args.delete_on_error)
        .with_replace_existing_file(args.force);

    if let Some(user_agent) = &args.user_agent {
        builder = builder.with_user_agent(user_agent.clone());
    }

    if let Some(url) = &args.proxy {
        let mut proxy = ProxyConfig::from_url(url.clone());
        if let Some(proxy_type) = args.proxy_type {
            proxy.proxy_type = proxy_type;
        }
        if let Some(username) = &args.proxy_username {
            proxy = proxy.with_auth(username.clone(), args.proxy_password.clone().unwrap_or_default());
        }
        builder = builder.with_proxy(proxy);
    }

    builder.build()
}

/// Last non-empty path segment of the URL, or a fixed fallback.
fn file_name_from_url(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()).map(str::to_owned))
        })
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_owned())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(std::io::stderr),
        )
        .init();
}
