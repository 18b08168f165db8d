//! Trigger-side handle that runs attempts on the tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::control::StopControl;
use crate::error::EngineError;
use crate::model::DownloadInfo;
use crate::orchestrator::{DownloadOrchestrator, DownloadResult};
use crate::storage::{FileSystem, Repository};
use crate::system::SystemFacade;

type RunFuture = Shared<BoxFuture<'static, Result<DownloadResult, String>>>;

struct ActiveRun {
    generation: u64,
    control: StopControl,
    result: RunFuture,
}

/// Runs at most one attempt per download at a time.
pub struct DownloadEngine {
    orchestrator: DownloadOrchestrator,
    repository: Arc<dyn Repository>,
    runs: Mutex<HashMap<Uuid, ActiveRun>>,
    generation: AtomicU64,
}

impl DownloadEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        fs: Arc<dyn FileSystem>,
        system: Arc<dyn SystemFacade>,
        config: EngineConfig,
    ) -> Self {
        let orchestrator = DownloadOrchestrator::new(
            Arc::clone(&repository),
            fs,
            system,
            Arc::new(config),
        );
        Self {
            orchestrator,
            repository,
            runs: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    pub async fn add(&self, info: &DownloadInfo) -> Result<(), EngineError> {
        self.repository.add_info(info).await
    }

    /// Spawns a new attempt for `id`.
    ///
    /// A run already registered for the id is stopped first; the new attempt begins
    /// once the old one has finalized. Must be called within a tokio runtime.
    pub fn start(&self, id: Uuid) {
        let mut runs = self.runs.lock();
        let previous = runs.remove(&id).map(|previous| {
            debug!(download_id = %id, "Replacing running attempt");
            previous.control.request_stop();
            previous.result
        });

        let control = StopControl::new();
        let orchestrator = self.orchestrator.clone();
        let attempt_control = control.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            orchestrator.run(id, attempt_control).await
        });
        let result = handle
            .map(|joined| joined.map_err(|e| e.to_string()))
            .boxed()
            .shared();

        info!(download_id = %id, "Attempt started");
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        runs.insert(
            id,
            ActiveRun {
                generation,
                control,
                result,
            },
        );
    }

    /// Returns false when no attempt is registered for `id`.
    pub fn pause(&self, id: Uuid) -> bool {
        self.signal(id, StopControl::request_pause)
    }

    pub fn stop(&self, id: Uuid) -> bool {
        self.signal(id, StopControl::request_stop)
    }

    fn signal(&self, id: Uuid, raise: fn(&StopControl)) -> bool {
        match self.runs.lock().get(&id) {
            Some(run) => {
                raise(&run.control);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.runs
            .lock()
            .get(&id)
            .is_some_and(|run| run.result.peek().is_none())
    }

    /// Waits for the registered attempt, then unregisters it unless it was
    /// replaced in the meantime.
    pub async fn wait(&self, id: Uuid) -> Result<DownloadResult, EngineError> {
        let (generation, result) = {
            let runs = self.runs.lock();
            let run = runs.get(&id).ok_or(EngineError::NotFound { id })?;
            (run.generation, run.result.clone())
        };

        let outcome = result.await;

        let mut runs = self.runs.lock();
        if runs.get(&id).is_some_and(|run| run.generation == generation) {
            runs.remove(&id);
        }
        drop(runs);

        outcome.map_err(|e| EngineError::internal(format!("download task failed: {e}")))
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        for run in self.runs.get_mut().values() {
            run.control.request_stop();
        }
    }
}
