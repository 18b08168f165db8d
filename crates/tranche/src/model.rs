//! Persisted records: downloads, their pieces and their retained headers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::status::StatusCode;

pub const ETAG_HEADER: &str = "ETag";
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// One resource being downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub id: Uuid,
    pub url: String,
    pub dir_path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    /// -1 when the length is unknown.
    pub total_bytes: i64,
    #[serde(deserialize_with = "deserialize_num_pieces")]
    num_pieces: u32,
    pub partial_support: bool,
    pub has_metadata: bool,
    pub status: StatusCode,
    pub status_msg: Option<String>,
    /// Consecutive failed attempts.
    pub num_failed: u32,
    pub visible: bool,
    /// Expected SHA-256 of the finished file, hex encoded.
    pub checksum: Option<String>,
    pub user_agent: Option<String>,
    pub date_added: DateTime<Utc>,
}

impl DownloadInfo {
    pub const MIN_PIECES: u32 = 1;
    pub const MAX_PIECES: u32 = 16;

    pub fn new(url: impl Into<String>, dir_path: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            dir_path: dir_path.into(),
            file_name: file_name.into(),
            mime_type: DEFAULT_MIME_TYPE.to_owned(),
            total_bytes: -1,
            num_pieces: Self::MIN_PIECES,
            partial_support: true,
            has_metadata: false,
            status: StatusCode::Pending,
            status_msg: None,
            num_failed: 0,
            visible: true,
            checksum: None,
            user_agent: None,
            date_added: Utc::now(),
        }
    }

    pub fn with_num_pieces(mut self, num_pieces: u32) -> Self {
        self.set_num_pieces(num_pieces);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    /// Clamps to `MIN_PIECES..=MAX_PIECES`.
    pub fn set_num_pieces(&mut self, num_pieces: u32) {
        self.num_pieces = num_pieces.clamp(Self::MIN_PIECES, Self::MAX_PIECES);
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir_path.join(&self.file_name)
    }

    fn base_piece_size(&self) -> i64 {
        self.total_bytes / i64::from(self.num_pieces)
    }

    /// Size of the piece at `index`; the last piece takes the remainder.
    ///
    /// With an unknown (or zero) total the single piece carries the total itself.
    pub fn piece_size(&self, index: u32) -> i64 {
        if self.total_bytes <= 0 {
            return self.total_bytes;
        }
        let base = self.base_piece_size();
        if index + 1 == self.num_pieces {
            self.total_bytes - base * i64::from(self.num_pieces - 1)
        } else {
            base
        }
    }

    pub fn piece_start_pos(&self, index: u32) -> i64 {
        if self.total_bytes <= 0 {
            return 0;
        }
        i64::from(index) * self.base_piece_size()
    }

    /// Inclusive end offset, or -1 when the piece size is unknown.
    pub fn piece_end_pos(&self, index: u32) -> i64 {
        let size = self.piece_size(index);
        if size < 0 {
            return -1;
        }
        self.piece_start_pos(index) + size - 1
    }

    /// Fresh piece rows covering the whole resource.
    pub fn make_pieces(&self) -> Vec<DownloadPiece> {
        (0..self.num_pieces)
            .map(|index| DownloadPiece::new(self.id, index, self.piece_size(index)))
            .collect()
    }

    pub fn downloaded_bytes(pieces: &[DownloadPiece]) -> i64 {
        pieces.iter().map(|piece| piece.cur_bytes).sum()
    }
}

fn deserialize_num_pieces<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let num_pieces = u32::deserialize(deserializer)?;
    Ok(num_pieces.clamp(DownloadInfo::MIN_PIECES, DownloadInfo::MAX_PIECES))
}

/// One contiguous byte range of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPiece {
    pub index: u32,
    pub info_id: Uuid,
    /// -1 when unknown.
    pub size: i64,
    pub cur_bytes: i64,
    pub status: StatusCode,
    pub status_msg: Option<String>,
    /// Bytes per second.
    pub speed: u64,
}

impl DownloadPiece {
    pub fn new(info_id: Uuid, index: u32, size: i64) -> Self {
        Self {
            index,
            info_id,
            size,
            cur_bytes: 0,
            status: StatusCode::Pending,
            status_msg: None,
            speed: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.size >= 0 && self.cur_bytes >= self.size
    }
}

/// A response header retained across attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub info_id: Uuid,
    pub name: String,
    pub value: Option<String>,
}

impl Header {
    pub fn new(info_id: Uuid, name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            info_id,
            name: name.into(),
            value,
        }
    }
}

/// The stored validator, if any. Empty values do not count.
pub fn find_etag(headers: &[Header]) -> Option<&str> {
    headers
        .iter()
        .find(|header| header.name == ETAG_HEADER)
        .and_then(|header| header.value.as_deref())
        .filter(|value| !value.is_empty())
}

/// Lowercases a `Content-Type` value and strips its parameters.
pub fn normalize_mime_type(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() {
        None
    } else {
        Some(essence.to_ascii_lowercase())
    }
}
