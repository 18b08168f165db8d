//! In-process HTTP server and engine harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode as HttpStatus, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tranche::storage::{FileSystem, LocalFileSystem, MemoryRepository, Repository};
use tranche::{
    DownloadInfo, DownloadOrchestrator, DownloadPiece, DownloadResult, EngineConfig, EngineError,
    FixedNetwork, Header, NetworkInfo, NetworkType, RetryPolicy, StopControl, SystemFacade,
};
use uuid::Uuid;

const CHUNK_SIZE: usize = 1024;

/// Deterministic body of `len` bytes.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Misbehaviour injected into ranged responses starting at `range_start`.
#[derive(Debug, Clone)]
pub enum FaultKind {
    /// Body breaks off after this many bytes.
    Truncate(usize),
    /// Answers with this status and no body.
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct Fault {
    pub range_start: u64,
    pub kind: FaultKind,
    pub remaining: Arc<AtomicUsize>,
}

impl Fault {
    fn fires(&self, start: u64) -> bool {
        self.range_start == start
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub body: Vec<u8>,
    pub etag: Option<String>,
    pub accept_ranges: bool,
    pub chunked: bool,
    pub content_type: Option<String>,
    pub chunk_delay: Option<Duration>,
    pub fault: Option<Fault>,
    /// Ranged answers start this many bytes past the requested offset.
    pub range_shift: usize,
}

impl Resource {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            etag: Some("\"v1\"".to_owned()),
            accept_ranges: true,
            chunked: false,
            content_type: Some("Application/Octet-Stream; charset=binary".to_owned()),
            chunk_delay: None,
            fault: None,
            range_shift: 0,
        }
    }

    pub fn without_etag(mut self) -> Self {
        self.etag = None;
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Cuts `times` responses for ranges starting at `range_start` after `after_bytes`.
    pub fn with_fault(self, range_start: u64, after_bytes: usize, times: usize) -> Self {
        self.with_fault_kind(range_start, FaultKind::Truncate(after_bytes), times)
    }

    /// Answers `times` ranged requests starting at `range_start` with `status`.
    pub fn with_status_fault(self, range_start: u64, status: u16, times: usize) -> Self {
        self.with_fault_kind(range_start, FaultKind::Status(status), times)
    }

    fn with_fault_kind(mut self, range_start: u64, kind: FaultKind, times: usize) -> Self {
        self.fault = Some(Fault {
            range_start,
            kind,
            remaining: Arc::new(AtomicUsize::new(times)),
        });
        self
    }

    pub fn misaligned(mut self, shift: usize) -> Self {
        self.range_shift = shift;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Route {
    Resource(Resource),
    Redirect { status: u16, location: String },
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub range: Option<String>,
    pub if_range: Option<String>,
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

pub struct TestServer {
    addr: std::net::SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn spawn(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        state.routes.lock().extend(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_owned(), route)),
        );

        let app = Router::new().fallback(handle).with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().len()
    }

    pub fn set_etag(&self, path: &str, etag: Option<&str>) {
        if let Some(Route::Resource(resource)) = self.state.routes.lock().get_mut(path) {
            resource.etag = etag.map(str::to_owned);
        }
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn handle(State(state): State<Arc<ServerState>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_owned();
    state.requests.lock().push(RecordedRequest {
        path: path.clone(),
        range: header_string(&headers, header::RANGE),
        if_range: header_string(&headers, header::IF_RANGE),
    });

    let route = state.routes.lock().get(&path).cloned();
    match route {
        None => HttpStatus::NOT_FOUND.into_response(),
        Some(Route::Status(code)) => status(code).into_response(),
        Some(Route::Redirect { status: code, location }) => {
            (status(code), [(header::LOCATION, location)]).into_response()
        }
        Some(Route::Resource(resource)) => serve(&resource, &headers),
    }
}

fn status(code: u16) -> HttpStatus {
    HttpStatus::from_u16(code).unwrap()
}

fn parse_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => total.checked_sub(1)?,
        end => end.parse::<usize>().ok()?.min(total.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

fn serve(resource: &Resource, headers: &HeaderMap) -> Response {
    let total = resource.body.len();

    let mut range = None;
    if resource.accept_ranges
        && let Some(value) = header_string(headers, header::RANGE)
    {
        match parse_range(&value, total) {
            Some(parsed) => range = Some(parsed),
            None => return HttpStatus::RANGE_NOT_SATISFIABLE.into_response(),
        }
    }
    if let Some(if_range) = header_string(headers, header::IF_RANGE)
        && resource.etag.as_deref() != Some(if_range.as_str())
    {
        range = None;
    }

    let mut cut = None;
    if let (Some((start, _)), Some(fault)) = (range, &resource.fault)
        && fault.fires(start as u64)
    {
        match fault.kind {
            FaultKind::Status(code) => return status(code).into_response(),
            FaultKind::Truncate(after) => cut = Some(after),
        }
    }

    let range = range.map(|(start, end)| ((start + resource.range_shift).min(end), end));
    let (code, slice) = match range {
        Some((start, end)) => (HttpStatus::PARTIAL_CONTENT, &resource.body[start..=end]),
        None => (HttpStatus::OK, &resource.body[..]),
    };

    let mut out = HeaderMap::new();
    if let Some(content_type) = &resource.content_type {
        out.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    }
    if let Some(etag) = &resource.etag {
        out.insert(header::ETAG, HeaderValue::from_str(etag).unwrap());
    }
    if resource.accept_ranges {
        out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    }
    if let Some((start, end)) = range {
        let value = format!("bytes {start}-{end}/{total}");
        out.insert(header::CONTENT_RANGE, HeaderValue::from_str(&value).unwrap());
    }
    if !resource.chunked {
        out.insert(header::CONTENT_LENGTH, HeaderValue::from(slice.len()));
    }

    let payload = Bytes::copy_from_slice(&slice[..cut.unwrap_or(slice.len()).min(slice.len())]);
    let body = Body::from_stream(body_stream(payload, resource.chunk_delay, cut.is_some()));
    (code, out, body).into_response()
}

/// Yields `payload` in fixed chunks, optionally paced, then breaks the connection
/// when `broken` is set.
fn body_stream(
    payload: Bytes,
    delay: Option<Duration>,
    broken: bool,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let chunks: Vec<io::Result<Bytes>> = (0..payload.len())
        .step_by(CHUNK_SIZE)
        .map(|offset| Ok(payload.slice(offset..(offset + CHUNK_SIZE).min(payload.len()))))
        .collect();
    let reset = broken.then(|| Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected reset")));

    stream::iter(chunks.into_iter().chain(reset)).then(move |item| async move {
        match (&item, delay) {
            // Let the bytes already queued reach the client before the reset.
            (Err(_), _) => tokio::time::sleep(Duration::from_millis(50)).await,
            (Ok(_), Some(delay)) => tokio::time::sleep(delay).await,
            (Ok(_), None) => {}
        }
        item
    })
}

/// Local disk with a fixed free-space answer.
#[derive(Debug)]
pub struct LimitedSpace {
    inner: LocalFileSystem,
    available: i64,
}

impl LimitedSpace {
    pub fn new(available: i64) -> Self {
        Self {
            inner: LocalFileSystem,
            available,
        }
    }
}

#[async_trait]
impl FileSystem for LimitedSpace {
    async fn create_file(&self, dir: &Path, name: &str, replace: bool) -> io::Result<PathBuf> {
        self.inner.create_file(dir, name, replace).await
    }

    async fn available_bytes(&self, _dir: &Path) -> i64 {
        self.available
    }

    async fn preallocate(&self, path: &Path, len: u64) -> io::Result<()> {
        self.inner.preallocate(path, len).await
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        self.inner.delete_file(path).await
    }
}

/// Memory repository with switchable faults.
#[derive(Debug, Default)]
pub struct FaultyRepository {
    inner: MemoryRepository,
    pub fail_header_writes: AtomicBool,
    pub drop_piece_rows: AtomicBool,
}

#[async_trait]
impl Repository for FaultyRepository {
    async fn get_info(&self, id: Uuid) -> Result<Option<DownloadInfo>, EngineError> {
        self.inner.get_info(id).await
    }

    async fn get_pieces_sorted(&self, id: Uuid) -> Result<Vec<DownloadPiece>, EngineError> {
        self.inner.get_pieces_sorted(id).await
    }

    async fn get_piece(&self, id: Uuid, index: u32) -> Result<Option<DownloadPiece>, EngineError> {
        self.inner.get_piece(id, index).await
    }

    async fn update_piece(&self, piece: &DownloadPiece) -> Result<(), EngineError> {
        self.inner.update_piece(piece).await
    }

    async fn get_headers(&self, id: Uuid) -> Result<Vec<Header>, EngineError> {
        self.inner.get_headers(id).await
    }

    async fn add_or_update_header(&self, header: &Header) -> Result<(), EngineError> {
        if self.fail_header_writes.load(Ordering::SeqCst) {
            return Err(EngineError::repository("header table is read-only"));
        }
        self.inner.add_or_update_header(header).await
    }

    async fn update_info(&self, info: &DownloadInfo, also_write_pieces: bool) -> Result<(), EngineError> {
        let write_pieces = also_write_pieces && !self.drop_piece_rows.load(Ordering::SeqCst);
        self.inner.update_info(info, write_pieces).await
    }

    async fn add_info(&self, info: &DownloadInfo) -> Result<(), EngineError> {
        self.inner.add_info(info).await
    }

    async fn remove_info(&self, id: Uuid) -> Result<(), EngineError> {
        self.inner.remove_info(id).await
    }
}

/// Reports Ethernet on the first query and Wi-Fi afterwards.
#[derive(Debug, Default)]
pub struct SwitchingNetwork {
    calls: AtomicUsize,
}

impl SystemFacade for SwitchingNetwork {
    fn active_network(&self) -> Option<NetworkInfo> {
        let kind = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            NetworkType::Ethernet
        } else {
            NetworkType::Wifi
        };
        Some(NetworkInfo {
            kind,
            connected: true,
        })
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig::builder()
        .with_retry_policy(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: false,
        })
        .with_connect_timeout(Duration::from_secs(5))
        .with_read_timeout(Duration::from_secs(5))
        .with_cancel_grace(Duration::from_secs(2))
        .build()
}

pub struct Harness {
    pub repository: Arc<dyn Repository>,
    pub fs: Arc<dyn FileSystem>,
    pub system: Arc<dyn SystemFacade>,
    pub dir: TempDir,
    pub orchestrator: DownloadOrchestrator,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(LocalFileSystem),
            Arc::new(FixedNetwork::default()),
        )
    }

    pub fn with_parts(
        config: EngineConfig,
        repository: Arc<dyn Repository>,
        fs: Arc<dyn FileSystem>,
        system: Arc<dyn SystemFacade>,
    ) -> Self {
        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&repository),
            Arc::clone(&fs),
            Arc::clone(&system),
            Arc::new(config),
        );
        Self {
            repository,
            fs,
            system,
            dir: tempfile::tempdir().unwrap(),
            orchestrator,
        }
    }

    pub async fn add(&self, url: &str, pieces: u32) -> DownloadInfo {
        let info = DownloadInfo::new(url, self.dir.path(), "download.bin").with_num_pieces(pieces);
        self.repository.add_info(&info).await.unwrap();
        info
    }

    pub async fn run(&self, id: Uuid) -> DownloadResult {
        self.orchestrator.run(id, StopControl::new()).await
    }

    pub async fn info(&self, id: Uuid) -> DownloadInfo {
        self.repository.get_info(id).await.unwrap().unwrap()
    }

    pub async fn pieces(&self, id: Uuid) -> Vec<DownloadPiece> {
        self.repository.get_pieces_sorted(id).await.unwrap()
    }

    pub fn file(&self, info: &DownloadInfo) -> Vec<u8> {
        std::fs::read(info.file_path()).unwrap()
    }
}
