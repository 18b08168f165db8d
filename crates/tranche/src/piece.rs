//! Transfer of one byte range into the destination file.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::control::StopControl;
use crate::error::{EngineError, StopRequest};
use crate::model::{DownloadInfo, DownloadPiece};
use crate::status::StatusCode;
use crate::storage::{FileSystem, Repository};

/// State shared by every piece of one attempt.
pub(crate) struct PieceContext {
    pub info: DownloadInfo,
    pub etag: Option<String>,
    pub repository: Arc<dyn Repository>,
    pub fs: Arc<dyn FileSystem>,
    pub connection: Arc<Connection>,
    pub config: Arc<EngineConfig>,
    pub control: StopControl,
}

/// Smoothed transfer rate in bytes per second.
#[derive(Debug)]
pub(crate) struct SpeedTracker {
    interval: Duration,
    window_start: Instant,
    window_bytes: u64,
    speed: u64,
}

impl SpeedTracker {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            window_bytes: 0,
            speed: 0,
        }
    }

    pub fn record(&mut self, bytes: u64, now: Instant) -> u64 {
        self.window_bytes += bytes;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= self.interval && !elapsed.is_zero() {
            let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX).max(1);
            let sample = self.window_bytes.saturating_mul(1000) / elapsed_ms;
            self.speed = if self.speed == 0 {
                sample
            } else {
                (self.speed.saturating_mul(3).saturating_add(sample)) / 4
            };
            self.window_start = now;
            self.window_bytes = 0;
        }
        self.speed
    }
}

/// Decides when accumulated progress is worth a repository write.
#[derive(Debug)]
struct ProgressGate {
    min_bytes: u64,
    min_interval: Duration,
    last_bytes: i64,
    last_at: Instant,
}

impl ProgressGate {
    fn new(config: &EngineConfig, bytes: i64, now: Instant) -> Self {
        Self {
            min_bytes: config.progress_min_bytes,
            min_interval: config.progress_min_interval,
            last_bytes: bytes,
            last_at: now,
        }
    }

    fn is_due(&self, bytes: i64, now: Instant) -> bool {
        let delta = u64::try_from(bytes - self.last_bytes).unwrap_or(0);
        delta >= self.min_bytes && now.saturating_duration_since(self.last_at) >= self.min_interval
    }

    fn mark(&mut self, bytes: i64, now: Instant) {
        self.last_bytes = bytes;
        self.last_at = now;
    }
}

pub(crate) struct PieceTransfer {
    ctx: Arc<PieceContext>,
    index: u32,
}

impl PieceTransfer {
    pub fn new(ctx: Arc<PieceContext>, index: u32) -> Self {
        Self { ctx, index }
    }

    /// Runs the piece and records its final state.
    ///
    /// Transfer failures end up in the piece row; only a failure to write that row
    /// is returned.
    #[instrument(skip(self), fields(download_id = %self.ctx.info.id, piece = self.index))]
    pub async fn run(self) -> Result<(), EngineError> {
        let info = &self.ctx.info;
        let Some(mut piece) = self.ctx.repository.get_piece(info.id, self.index).await? else {
            warn!("Piece row is missing");
            return Ok(());
        };

        if piece.status == StatusCode::Success {
            debug!("Piece already finished");
            return Ok(());
        }
        if piece.is_complete() {
            piece.status = StatusCode::Success;
            piece.status_msg = None;
            piece.speed = 0;
            return self.ctx.repository.update_piece(&piece).await;
        }

        if piece.cur_bytes > 0 && !info.partial_support {
            debug!(bytes = piece.cur_bytes, "Resource cannot resume; restarting piece");
            piece.cur_bytes = 0;
        }

        piece.status = StatusCode::Running;
        piece.status_msg = None;

        match self.transfer(&mut piece).await {
            Ok(()) => {
                debug!(bytes = piece.cur_bytes, "Piece finished");
                piece.status = StatusCode::Success;
                piece.status_msg = None;
            }
            Err(stop) => {
                let stop = if self.ctx.control.is_requested() {
                    self.ctx.control.check().unwrap_or(stop)
                } else {
                    stop
                };
                if stop.status().is_retryable() {
                    warn!(status = %stop.status(), bytes = piece.cur_bytes, error = %stop, "Piece failed");
                } else {
                    debug!(status = %stop.status(), bytes = piece.cur_bytes, "Piece ended");
                }
                let (status, message) = stop.into_parts();
                piece.status = status;
                piece.status_msg = message;
            }
        }

        piece.speed = 0;
        self.ctx.repository.update_piece(&piece).await
    }

    fn request_headers(&self, piece: &DownloadPiece, ranged: bool) -> HeaderMap {
        let info = &self.ctx.info;
        let mut headers = HeaderMap::new();

        if ranged {
            let start = info.piece_start_pos(self.index) + piece.cur_bytes;
            let end = info.piece_end_pos(self.index);
            let range = if end >= 0 {
                format!("bytes={start}-{end}")
            } else {
                format!("bytes={start}-")
            };
            if let Ok(value) = HeaderValue::from_str(&range) {
                headers.insert(header::RANGE, value);
            }
        }

        // Validator goes on every ranged request, fresh pieces included.
        if ranged
            && let Some(etag) = self.ctx.etag.as_deref()
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            headers.insert(header::IF_RANGE, value);
        }

        if let Some(user_agent) = info.user_agent.as_deref()
            && let Ok(value) = HeaderValue::from_str(user_agent)
        {
            headers.insert(header::USER_AGENT, value);
        }

        headers
    }

    async fn transfer(&self, piece: &mut DownloadPiece) -> Result<(), StopRequest> {
        let ctx = &self.ctx;
        let info = &ctx.info;
        let token = ctx.control.token();

        let start = info.piece_start_pos(self.index) + piece.cur_bytes;
        let ranged = info.partial_support && (info.num_pieces() > 1 || piece.cur_bytes > 0);
        let headers = self.request_headers(piece, ranged);

        debug!(start, ranged, "Requesting piece");
        let exchange = ctx.connection.execute(&info.url, headers, token).await?;

        if ranged && !exchange.is_partial() && !(info.num_pieces() == 1 && start == 0) {
            return Err(StopRequest::with_message(
                StatusCode::CannotResume,
                "Expected partial content, but received OK",
            ));
        }

        if exchange.is_partial() {
            let expected = u64::try_from(start).unwrap_or(0);
            match exchange.content_range_start() {
                Some(first) if first == expected => {}
                Some(first) => {
                    return Err(StopRequest::with_message(
                        StatusCode::CannotResume,
                        format!("Server returned range starting at {first}, expected {expected}"),
                    ));
                }
                None => {
                    return Err(StopRequest::with_message(
                        StatusCode::CannotResume,
                        "Partial content without a valid Content-Range",
                    ));
                }
            }
        }

        let path = ctx.fs.file_path(&info.dir_path, &info.file_name);
        let mut file = ctx
            .fs
            .open_for_write(&path)
            .await
            .map_err(|e| StopRequest::with_cause(StatusCode::FileError, e))?;
        file.seek(SeekFrom::Start(u64::try_from(start).unwrap_or(0)))
            .await
            .map_err(|e| StopRequest::with_cause(StatusCode::FileError, e))?;
        let mut writer = BufWriter::with_capacity(ctx.config.buffer_size, file);

        let now = Instant::now();
        let mut speed = SpeedTracker::new(ctx.config.speed_sample_interval, now);
        let mut gate = ProgressGate::new(&ctx.config, piece.cur_bytes, now);
        let mut flushed_bytes = piece.cur_bytes;

        let mut stream = std::pin::pin!(exchange.into_stream());
        let streamed = loop {
            if piece.size >= 0 && piece.cur_bytes >= piece.size {
                break Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    break Err(ctx.control.check().unwrap_or_else(StopRequest::cancelled));
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                None => {
                    if piece.size >= 0 && piece.cur_bytes < piece.size {
                        break Err(StopRequest::with_message(
                            StatusCode::HttpDataError,
                            "closed socket before end of file",
                        ));
                    }
                    break Ok(());
                }
                Some(Err(e)) => break Err(StopRequest::with_cause(StatusCode::HttpDataError, e)),
                Some(Ok(chunk)) => chunk,
            };

            let mut len = chunk.len();
            if piece.size >= 0 {
                let remaining = usize::try_from(piece.size - piece.cur_bytes).unwrap_or(0);
                if len > remaining {
                    debug!(discarded = len - remaining, "Discarding bytes past the piece end");
                    len = remaining;
                }
            }

            if let Err(e) = writer.write_all(&chunk[..len]).await {
                break Err(StopRequest::with_cause(StatusCode::FileError, e));
            }
            piece.cur_bytes += len as i64;

            let now = Instant::now();
            piece.speed = speed.record(len as u64, now);

            if gate.is_due(piece.cur_bytes, now) {
                if let Err(e) = writer.flush().await {
                    break Err(StopRequest::with_cause(StatusCode::FileError, e));
                }
                flushed_bytes = piece.cur_bytes;
                let mut progress = piece.clone();
                progress.status = StatusCode::Running;
                if let Err(e) = ctx.repository.update_piece(&progress).await {
                    break Err(StopRequest::with_cause(StatusCode::UnknownError, e));
                }
                gate.mark(piece.cur_bytes, now);
            }
        };

        match writer.flush().await {
            Ok(()) => streamed,
            Err(e) => {
                piece.cur_bytes = flushed_bytes;
                Err(StopRequest::with_cause(StatusCode::FileError, e))
            }
        }
    }
}
