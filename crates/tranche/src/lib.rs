//! Resumable, piece-wise HTTP download engine.
//!
//! A download is split into byte-range pieces that transfer concurrently; each
//! attempt folds the piece outcomes into one persisted [`StatusCode`] and decides
//! whether to retry, wait for a network, or give up.

pub mod config;
pub mod connection;
pub mod control;
pub mod engine;
pub mod error;
pub mod model;
pub mod orchestrator;
mod piece;
pub mod proxy;
pub mod retry;
pub mod status;
pub mod storage;
pub mod system;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use control::StopControl;
pub use engine::DownloadEngine;
pub use error::{EngineError, StopRequest};
pub use model::{DownloadInfo, DownloadPiece, Header};
pub use orchestrator::{DownloadOrchestrator, DownloadResult};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use retry::RetryPolicy;
pub use status::{DownloadOutcome, StatusCode};
pub use storage::{FileSystem, LocalFileSystem, MemoryRepository, Repository};
pub use system::{FixedNetwork, NetworkInfo, NetworkType, SystemFacade};
