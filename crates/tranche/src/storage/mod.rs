//! Persistence and filesystem collaborators.
//!
//! The engine never touches a database or the disk directly; it goes through
//! [`Repository`] for records and [`FileSystem`] for the destination file. Reference
//! implementations live in [`memory`] and [`local`].

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{DownloadInfo, DownloadPiece, Header};

pub mod local;
pub mod memory;

pub use local::LocalFileSystem;
pub use memory::MemoryRepository;

/// Store of download, piece and header records.
///
/// Writes to one row are serialized by the implementation; the engine relies on
/// this when pieces report progress concurrently.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_info(&self, id: Uuid) -> Result<Option<DownloadInfo>, EngineError>;

    /// Pieces of a download in ascending index order.
    async fn get_pieces_sorted(&self, id: Uuid) -> Result<Vec<DownloadPiece>, EngineError>;

    async fn get_piece(&self, id: Uuid, index: u32) -> Result<Option<DownloadPiece>, EngineError>;

    async fn update_piece(&self, piece: &DownloadPiece) -> Result<(), EngineError>;

    async fn get_headers(&self, id: Uuid) -> Result<Vec<Header>, EngineError>;

    /// Replaces the value of `(info_id, name)`, inserting the row if needed.
    async fn add_or_update_header(&self, header: &Header) -> Result<(), EngineError>;

    /// Writes the info; with `also_write_pieces` the piece rows are recreated from
    /// [`DownloadInfo::make_pieces`].
    async fn update_info(&self, info: &DownloadInfo, also_write_pieces: bool) -> Result<(), EngineError>;

    async fn add_info(&self, info: &DownloadInfo) -> Result<(), EngineError>;

    async fn remove_info(&self, id: Uuid) -> Result<(), EngineError>;
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Creates (or, with `replace`, truncates) `dir/name` and returns its path.
    async fn create_file(&self, dir: &Path, name: &str, replace: bool) -> io::Result<PathBuf>;

    /// Free bytes on the volume holding `dir`, or -1 when unknown.
    async fn available_bytes(&self, dir: &Path) -> i64;

    async fn preallocate(&self, path: &Path, len: u64) -> io::Result<()>;

    async fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Opens an existing file for positioned writes without truncating it.
    async fn open_for_write(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new().write(true).open(path).await
    }

    fn file_path(&self, dir: &Path, name: &str) -> PathBuf {
        dir.join(name)
    }
}
