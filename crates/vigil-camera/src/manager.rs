//! Registry of active camera workers, keyed by source id.

use crate::capture::{CameraSpec, CaptureBackend};
use crate::worker::{CameraWorker, FrameCallback, WorkerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use vigil_core::IdentityStore;

/// Supervises a dynamic set of [`CameraWorker`]s.
///
/// Nothing propagates past the manager: losing one camera must not
/// take down the process or the other cameras.
pub struct CameraManager {
    backend: Arc<dyn CaptureBackend>,
    store: Arc<dyn IdentityStore>,
    on_frame: FrameCallback,
    config: WorkerConfig,
    workers: HashMap<i64, CameraWorker>,
}

impl CameraManager {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        store: Arc<dyn IdentityStore>,
        on_frame: FrameCallback,
        config: WorkerConfig,
    ) -> Self {
        Self {
            backend,
            store,
            on_frame,
            config,
            workers: HashMap::new(),
        }
    }

    /// Add or replace the worker for a source.
    ///
    /// An existing worker for the same id is stopped and drained before
    /// the replacement starts, so no two concurrent workers ever exist
    /// for one source.
    pub fn upsert(&mut self, spec: CameraSpec) {
        if let Some(mut old) = self.workers.remove(&spec.id) {
            tracing::info!(source = spec.id, "replacing worker");
            old.stop();
        }

        let mut worker = CameraWorker::new(
            spec.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.store),
            Arc::clone(&self.on_frame),
            self.config.clone(),
        );
        worker.start();
        self.workers.insert(spec.id, worker);
    }

    /// Stop and drop the worker for a source, if any.
    pub fn remove(&mut self, source_id: i64) {
        if let Some(mut worker) = self.workers.remove(&source_id) {
            worker.stop();
        }
    }

    /// Stop every worker and clear the registry. Safe to call twice and
    /// from a shutdown path; stopping one worker is independent of the
    /// others.
    pub fn stop_all(&mut self) {
        for (_, mut worker) in self.workers.drain() {
            worker.stop();
        }
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }
}
