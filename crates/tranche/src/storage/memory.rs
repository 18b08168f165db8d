use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::Repository;
use crate::error::EngineError;
use crate::model::{DownloadInfo, DownloadPiece, Header};

#[derive(Debug)]
struct Entry {
    info: DownloadInfo,
    pieces: BTreeMap<u32, DownloadPiece>,
    headers: Vec<Header>,
}

/// Process-local repository.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_info(&self, id: Uuid) -> Result<Option<DownloadInfo>, EngineError> {
        Ok(self.entries.read().get(&id).map(|entry| entry.info.clone()))
    }

    async fn get_pieces_sorted(&self, id: Uuid) -> Result<Vec<DownloadPiece>, EngineError> {
        Ok(self
            .entries
            .read()
            .get(&id)
            .map(|entry| entry.pieces.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_piece(&self, id: Uuid, index: u32) -> Result<Option<DownloadPiece>, EngineError> {
        Ok(self
            .entries
            .read()
            .get(&id)
            .and_then(|entry| entry.pieces.get(&index).cloned()))
    }

    async fn update_piece(&self, piece: &DownloadPiece) -> Result<(), EngineError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&piece.info_id)
            .ok_or(EngineError::NotFound { id: piece.info_id })?;
        entry.pieces.insert(piece.index, piece.clone());
        Ok(())
    }

    async fn get_headers(&self, id: Uuid) -> Result<Vec<Header>, EngineError> {
        Ok(self
            .entries
            .read()
            .get(&id)
            .map(|entry| entry.headers.clone())
            .unwrap_or_default())
    }

    async fn add_or_update_header(&self, header: &Header) -> Result<(), EngineError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&header.info_id)
            .ok_or(EngineError::NotFound { id: header.info_id })?;
        match entry.headers.iter_mut().find(|h| h.name == header.name) {
            Some(existing) => existing.value = header.value.clone(),
            None => entry.headers.push(header.clone()),
        }
        Ok(())
    }

    async fn update_info(&self, info: &DownloadInfo, also_write_pieces: bool) -> Result<(), EngineError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&info.id)
            .ok_or(EngineError::NotFound { id: info.id })?;
        entry.info = info.clone();
        if also_write_pieces {
            entry.pieces = info
                .make_pieces()
                .into_iter()
                .map(|piece| (piece.index, piece))
                .collect();
        }
        Ok(())
    }

    async fn add_info(&self, info: &DownloadInfo) -> Result<(), EngineError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&info.id) {
            return Err(EngineError::repository(format!(
                "download {} already exists",
                info.id
            )));
        }
        entries.insert(
            info.id,
            Entry {
                info: info.clone(),
                pieces: BTreeMap::new(),
                headers: Vec::new(),
            },
        );
        Ok(())
    }

    async fn remove_info(&self, id: Uuid) -> Result<(), EngineError> {
        self.entries.write().remove(&id);
        Ok(())
    }
}
