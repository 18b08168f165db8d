//! One attempt at a download, from metadata negotiation to the persisted verdict.
//!
//! An attempt walks `START -> FETCH_METADATA? -> PREPARE_FILE -> RUN_PIECES -> AGGREGATE`.
//! Every phase either advances or hands back a [`StopRequest`]; whatever happens, the
//! attempt ends by writing the download record once more.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connection::{Connection, Exchange};
use crate::control::StopControl;
use crate::error::{EngineError, StopRequest};
use crate::model::{DownloadInfo, ETAG_HEADER, Header, find_etag, normalize_mime_type};
use crate::piece::{PieceContext, PieceTransfer};
use crate::retry::{Aggregate, RetryConditions, RetryDecision, aggregate};
use crate::status::{DownloadOutcome, StatusCode};
use crate::storage::{FileSystem, Repository};
use crate::system::{NetworkType, SystemFacade};

/// What an attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub id: Uuid,
    pub outcome: DownloadOutcome,
    /// Persisted status at the end of the attempt.
    pub status: StatusCode,
    /// Suggested wait before the next attempt, set with `WaitingToRetry`.
    pub retry_after: Option<Duration>,
}

impl DownloadResult {
    fn without_attempt(id: Uuid, status: StatusCode) -> Self {
        Self {
            id,
            outcome: DownloadOutcome::from(status),
            status,
            retry_after: None,
        }
    }
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    repository: Arc<dyn Repository>,
    fs: Arc<dyn FileSystem>,
    system: Arc<dyn SystemFacade>,
    config: Arc<EngineConfig>,
}

impl DownloadOrchestrator {
    pub fn new(
        repository: Arc<dyn Repository>,
        fs: Arc<dyn FileSystem>,
        system: Arc<dyn SystemFacade>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            repository,
            fs,
            system,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one attempt for `id`.
    ///
    /// Never fails: collaborator errors and panics are recorded as
    /// [`StatusCode::UnknownError`] on the download itself.
    #[instrument(skip(self, control), fields(download_id = %id))]
    pub async fn run(&self, id: Uuid, control: StopControl) -> DownloadResult {
        let info = match self.repository.get_info(id).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                warn!("Download not found, skipping");
                return DownloadResult::without_attempt(id, StatusCode::Stopped);
            }
            Err(e) => {
                error!(error = %e, "Unable to load download");
                return DownloadResult::without_attempt(id, StatusCode::UnknownError);
            }
        };

        if info.status == StatusCode::Success {
            info!("Download already finished, skipping");
            return DownloadResult::without_attempt(id, StatusCode::Success);
        }

        let mut attempt = Attempt::new(self, control, info);
        let executed = AssertUnwindSafe(attempt.execute()).catch_unwind().await;

        let stop = match executed {
            Ok(Ok(())) => None,
            Ok(Err(stop)) => Some(stop),
            Err(panic) => Some(StopRequest::with_message(
                StatusCode::UnknownError,
                panic_message(panic.as_ref()),
            )),
        };

        match stop {
            Some(stop) if stop.status().is_retryable() && !attempt.ran_pieces => {
                attempt.retry_early(stop).await;
            }
            Some(stop) => attempt.apply_stop(stop),
            None => {
                let checked = AssertUnwindSafe(attempt.check_pieces()).catch_unwind().await;
                match checked {
                    Ok(Ok(())) => {}
                    Ok(Err(stop)) => attempt.apply_stop(stop),
                    Err(panic) => attempt.apply_stop(StopRequest::with_message(
                        StatusCode::UnknownError,
                        panic_message(panic.as_ref()),
                    )),
                }
            }
        }

        attempt.finalize().await
    }
}

struct Attempt<'a> {
    orchestrator: &'a DownloadOrchestrator,
    control: StopControl,
    info: DownloadInfo,
    network_at_start: Option<NetworkType>,
    fetched_metadata: bool,
    ran_pieces: bool,
    retry_after: Option<Duration>,
}

impl<'a> Attempt<'a> {
    fn new(orchestrator: &'a DownloadOrchestrator, control: StopControl, info: DownloadInfo) -> Self {
        Self {
            orchestrator,
            control,
            info,
            network_at_start: None,
            fetched_metadata: false,
            ran_pieces: false,
            retry_after: None,
        }
    }

    fn repository(&self) -> &dyn Repository {
        self.orchestrator.repository.as_ref()
    }

    fn config(&self) -> &EngineConfig {
        &self.orchestrator.config
    }

    fn check_stop(&self) -> Result<(), StopRequest> {
        match self.control.check() {
            Some(stop) => Err(stop),
            None => Ok(()),
        }
    }

    fn apply_stop(&mut self, stop: StopRequest) {
        let (status, message) = stop.into_parts();
        if status.is_error() {
            warn!(status = %status, message = ?message, "Attempt stopped");
        } else {
            info!(status = %status, message = ?message, "Attempt stopped");
        }
        self.info.status = status;
        self.info.status_msg = message;
    }

    async fn execute(&mut self) -> Result<(), StopRequest> {
        self.info.status = if self.info.has_metadata {
            StatusCode::Running
        } else {
            StatusCode::FetchMetadata
        };
        self.info.status_msg = None;
        self.repository().update_info(&self.info, false).await?;

        self.network_at_start = self
            .orchestrator
            .system
            .active_network()
            .map(|network| network.kind);

        self.check_stop()?;

        let connection = Arc::new(Connection::new(self.config())?);

        if !self.info.has_metadata {
            self.fetch_metadata(&connection).await?;
        }

        self.prepare_file().await?;
        self.run_pieces(connection).await
    }

    #[instrument(skip_all)]
    async fn fetch_metadata(&mut self, connection: &Connection) -> Result<(), StopRequest> {
        info!(url = %self.info.url, "Fetching metadata");

        let mut headers = HeaderMap::new();
        if let Some(user_agent) = self.info.user_agent.as_deref()
            && let Ok(value) = HeaderValue::from_str(user_agent)
        {
            headers.insert(header::USER_AGENT, value);
        }

        let exchange = connection
            .execute(&self.info.url, headers, self.control.token())
            .await
            .map_err(|stop| self.control.check().unwrap_or(stop))?;

        if let Some(moved) = &exchange.permanent_url {
            info!(url = %moved, "Resource moved permanently");
            self.info.url = moved.to_string();
        }

        self.parse_metadata(&exchange).await?;
        self.fetched_metadata = true;

        self.check_stop()
    }

    async fn parse_metadata(&mut self, exchange: &Exchange) -> Result<(), StopRequest> {
        if let Some(mime_type) = exchange
            .header(header::CONTENT_TYPE.as_str())
            .and_then(normalize_mime_type)
        {
            self.info.mime_type = mime_type;
        }

        self.info.total_bytes = if exchange.has_header(header::TRANSFER_ENCODING.as_str()) {
            -1
        } else {
            exchange.content_length()
        };
        self.info.partial_support = exchange
            .header(header::ACCEPT_RANGES.as_str())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("bytes"));

        let etag = exchange.header(header::ETAG.as_str()).map(str::to_owned);
        self.repository()
            .add_or_update_header(&Header::new(self.info.id, ETAG_HEADER, etag))
            .await?;

        let requested = self.info.num_pieces();
        let pieces = if !self.info.partial_support || self.info.total_bytes <= 0 {
            1
        } else {
            let total = u32::try_from(self.info.total_bytes).unwrap_or(u32::MAX);
            requested.min(total)
        };
        self.info.set_num_pieces(pieces);

        debug!(
            total_bytes = self.info.total_bytes,
            partial_support = self.info.partial_support,
            pieces = self.info.num_pieces(),
            mime_type = %self.info.mime_type,
            "Metadata received"
        );

        self.info.has_metadata = true;
        self.info.status = StatusCode::Running;
        self.repository().update_info(&self.info, true).await?;
        Ok(())
    }

    async fn prepare_file(&mut self) -> Result<(), StopRequest> {
        let fs = self.orchestrator.fs.as_ref();
        let replace = self.config().replace_existing_file && self.fetched_metadata;

        let path = fs
            .create_file(&self.info.dir_path, &self.info.file_name, replace)
            .await
            .map_err(|e| StopRequest::with_cause(StatusCode::FileError, e))?;

        if self.info.total_bytes == 0 {
            return Err(StopRequest::with_message(
                StatusCode::Success,
                "Length is zero; skipping",
            ));
        }

        if !self.orchestrator.system.check_connectivity() {
            return Err(StopRequest::new(StatusCode::WaitingForNetwork));
        }

        let available = fs.available_bytes(&self.info.dir_path).await;
        if available != -1 && available < self.info.total_bytes {
            return Err(StopRequest::with_message(
                StatusCode::InsufficientSpace,
                "No space left on device",
            ));
        }

        if self.info.total_bytes > 0 && self.config().preallocate {
            let len = u64::try_from(self.info.total_bytes).unwrap_or(0);
            match fs.preallocate(&path, len).await {
                Ok(()) => debug!(bytes = len, "Preallocated destination"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.control.request_stop();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                    ) =>
                {
                    return Err(StopRequest::with_cause(StatusCode::FileError, e));
                }
                Err(e) => debug!(error = %e, "Preallocation unsupported, continuing"),
            }
        }

        self.check_stop()
    }

    async fn run_pieces(&mut self, connection: Arc<Connection>) -> Result<(), StopRequest> {
        self.ran_pieces = true;

        let headers = self.repository().get_headers(self.info.id).await?;
        let ctx = Arc::new(PieceContext {
            info: self.info.clone(),
            etag: find_etag(&headers).map(str::to_owned),
            repository: Arc::clone(&self.orchestrator.repository),
            fs: Arc::clone(&self.orchestrator.fs),
            connection,
            config: Arc::clone(&self.orchestrator.config),
            control: self.control.clone(),
        });

        info!(pieces = self.info.num_pieces(), total_bytes = self.info.total_bytes, "Starting pieces");

        let mut tasks = JoinSet::new();
        for index in 0..self.info.num_pieces() {
            tasks.spawn(PieceTransfer::new(Arc::clone(&ctx), index).run());
        }

        let token = self.control.token().clone();
        let mut failure = None;
        let drained = loop {
            tokio::select! {
                biased;
                joined = tasks.join_next() => match joined {
                    Some(joined) => settle_piece(joined, &mut failure),
                    None => break true,
                },
                _ = token.cancelled() => break false,
            }
        };

        if !drained {
            let grace = self.config().cancel_grace;
            let settled = tokio::time::timeout(grace, async {
                while let Some(joined) = tasks.join_next().await {
                    settle_piece(joined, &mut failure);
                }
            })
            .await;

            if settled.is_err() {
                warn!(remaining = tasks.len(), "Pieces missed the cancellation grace period, aborting");
                tasks.shutdown().await;
            }
        }

        match failure {
            Some(stop) => Err(stop),
            None => Ok(()),
        }
    }

    /// Folds the persisted piece rows into the download status.
    async fn check_pieces(&mut self) -> Result<(), StopRequest> {
        if !self.ran_pieces {
            return Ok(());
        }

        let pieces = self.repository().get_pieces_sorted(self.info.id).await?;
        if pieces.is_empty() || pieces.len() != self.info.num_pieces() as usize {
            error!(found = pieces.len(), expected = self.info.num_pieces(), "Some pieces are missing");
            self.info.status = StatusCode::UnknownError;
            self.info.status_msg = Some("Some pieces are missing".to_owned());
            return Ok(());
        }

        if let Some(stop) = self.control.check() {
            self.apply_stop(stop);
            return Ok(());
        }

        self.info.status = StatusCode::Success;
        self.info.status_msg = None;

        match aggregate(self.info.status, &pieces) {
            Aggregate::Retryable {
                index,
                status,
                message,
                made_progress,
            } => {
                warn!(piece = index, status = %status, made_progress, "Retryable piece failure");
                self.handle_retryable(status, message, made_progress).await?;
            }
            Aggregate::Replace { status, message } => {
                self.info.status = status;
                self.info.status_msg = message;
            }
            Aggregate::Success => {
                if pieces.len() == 1 && self.info.total_bytes == -1 {
                    self.info.total_bytes = pieces[0].cur_bytes;
                }
                self.info.num_failed = 0;
                info!(bytes = DownloadInfo::downloaded_bytes(&pieces), "Download finished");
            }
        }

        Ok(())
    }

    /// Transient failure before any piece ran, typically during metadata.
    async fn retry_early(&mut self, stop: StopRequest) {
        let (status, message) = stop.into_parts();
        warn!(status = %status, message = ?message, "Transient failure before transfer");
        if let Err(stop) = self.handle_retryable(status, message, false).await {
            self.apply_stop(stop);
        }
    }

    async fn handle_retryable(
        &mut self,
        status: StatusCode,
        message: Option<String>,
        made_progress: bool,
    ) -> Result<(), StopRequest> {
        self.info.num_failed += 1;

        let headers = self.repository().get_headers(self.info.id).await?;
        let system = &self.orchestrator.system;
        let network_intact = system.check_connectivity()
            && system
                .active_network()
                .zip(self.network_at_start)
                .is_some_and(|(network, started_on)| network.kind == started_on);

        let conditions = RetryConditions {
            network_intact,
            has_validator: find_etag(&headers).is_some(),
            made_progress,
        };

        let policy = &self.orchestrator.config.retry;
        match policy.decide(self.info.num_failed, conditions) {
            RetryDecision::Wait(next) => {
                self.info.status = next;
                self.info.status_msg = message;
                if next == StatusCode::WaitingToRetry {
                    self.retry_after = Some(policy.retry_after(self.info.num_failed));
                }
                info!(
                    status = %next,
                    num_failed = self.info.num_failed,
                    retry_after = ?self.retry_after,
                    "Scheduling retry"
                );
            }
            RetryDecision::Exhausted => {
                warn!(num_failed = self.info.num_failed, status = %status, "Retries exhausted");
                self.info.status = status;
                self.info.status_msg = message;
            }
        }

        Ok(())
    }

    async fn finalize(self) -> DownloadResult {
        if let Err(e) = self.repository().update_info(&self.info, false).await {
            error!(error = %e, "Unable to persist download");
        }

        if self.info.status.is_error() && self.config().delete_file_on_error {
            let fs = self.orchestrator.fs.as_ref();
            let path = fs.file_path(&self.info.dir_path, &self.info.file_name);
            if let Err(e) = fs.delete_file(&path).await {
                debug!(error = %e, path = %path.display(), "Unable to delete partial file");
            }
        }

        info!(status = %self.info.status, "Attempt finished");
        DownloadResult {
            id: self.info.id,
            outcome: DownloadOutcome::from(self.info.status),
            status: self.info.status,
            retry_after: self.retry_after,
        }
    }
}

fn settle_piece(joined: Result<Result<(), EngineError>, JoinError>, failure: &mut Option<StopRequest>) {
    let stop = match joined {
        Ok(Ok(())) => return,
        Ok(Err(e)) => StopRequest::from(e),
        Err(join_error) if join_error.is_cancelled() => return,
        Err(join_error) => StopRequest::with_message(
            StatusCode::UnknownError,
            format!("Piece task panicked: {join_error}"),
        ),
    };
    error!(error = %stop, "Piece failed internally");
    if failure.is_none() {
        *failure = Some(stop);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Download attempt panicked".to_owned()
    }
}
