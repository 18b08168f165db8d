//! SHA-256 verification of finished downloads.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of the file contents.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compares case-insensitively; the expected value must be 64 hex digits.
pub fn verify(path: &Path, expected: &str) -> Result<()> {
    let expected = expected.trim().to_ascii_lowercase();
    if !matches!(hex::decode(&expected), Ok(bytes) if bytes.len() == 32) {
        return Err(AppError::InvalidInput(format!(
            "not a SHA-256 digest: {expected}"
        )));
    }

    let actual = file_sha256(path)?;
    if actual != expected {
        return Err(AppError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Runs [`verify`] on the blocking pool.
pub async fn verify_file(path: PathBuf, expected: String) -> Result<()> {
    tokio::task::spawn_blocking(move || verify(&path, &expected)).await?
}
