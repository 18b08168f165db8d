use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::fs::{self, OpenOptions};
use tracing::debug;

use super::FileSystem;

/// [`FileSystem`] backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn create_file(&self, dir: &Path, name: &str, replace: bool) -> io::Result<PathBuf> {
        fs::create_dir_all(dir).await?;
        let path = self.file_path(dir, name);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(replace)
            .open(&path)
            .await?;
        Ok(path)
    }

    async fn available_bytes(&self, dir: &Path) -> i64 {
        let dir = dir.to_path_buf();
        let result = tokio::task::spawn_blocking(move || fs2::available_space(&dir))
            .await
            .map_err(|e| io::Error::other(e.to_string()))
            .and_then(|inner| inner);

        match result {
            Ok(bytes) => i64::try_from(bytes).unwrap_or(i64::MAX),
            Err(e) => {
                debug!(error = %e, "Free space unknown");
                -1
            }
        }
    }

    async fn preallocate(&self, path: &Path, len: u64) -> io::Result<()> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() >= len {
                return Ok(());
            }
            file.allocate(len)
        })
        .await
        .map_err(|e| io::Error::other(e.to_string()))?
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path).await
    }
}
