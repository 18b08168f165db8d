use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tracing::debug;
use tranche::{DownloadInfo, Repository};
use uuid::Uuid;

const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Redraws a bar from the persisted piece rows until aborted.
pub fn spawn(repository: Arc<dyn Repository>, id: Uuid, label: String) -> (ProgressBar, JoinHandle<()>) {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(spinner_style());
    pb.set_message(label);

    let bar = pb.clone();
    let handle = tokio::spawn(async move {
        let mut sized = false;
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            ticker.tick().await;

            let info = match repository.get_info(id).await {
                Ok(Some(info)) => info,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Progress refresh failed");
                    continue;
                }
            };
            let pieces = repository.get_pieces_sorted(id).await.unwrap_or_default();

            if !sized && info.total_bytes > 0 {
                bar.set_length(info.total_bytes as u64);
                bar.set_style(bar_style());
                sized = true;
            }
            bar.set_position(DownloadInfo::downloaded_bytes(&pieces).max(0) as u64);

            let speed: u64 = pieces.iter().map(|piece| piece.speed).sum();
            bar.set_prefix(format!("{}/s", indicatif::HumanBytes(speed)));
        }
    });

    (pb, handle)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.yellow} [{bar:30.yellow/white}] {bytes}/{total_bytes} {prefix} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {bytes} {prefix} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
