//! Worker manager: start/stop bookkeeping for camera workers.

use crate::events::WorkerStatus;
use crate::store::Camera;
use crate::worker::{run_worker, WorkerContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum WorkerManagerError {
    #[error("maximum simultaneous streams ({0}) reached")]
    LimitReached(usize),
}

struct WorkerHandle {
    room_id: i64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    status: watch::Receiver<WorkerStatus>,
}

/// Owns every running camera worker.
pub struct WorkerManager {
    ctx: Arc<WorkerContext>,
    workers: Mutex<HashMap<i64, WorkerHandle>>,
    max_streams: usize,
    shutdown_grace: Duration,
}

impl WorkerManager {
    pub fn new(ctx: Arc<WorkerContext>, max_streams: usize, shutdown_grace: Duration) -> Self {
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
            max_streams,
            shutdown_grace,
        }
    }

    /// Start a worker for a camera. Starting an already-running camera is a
    /// no-op (returns false).
    pub async fn start(&self, camera: Camera) -> Result<bool, WorkerManagerError> {
        let mut workers = self.workers.lock().await;
        workers.retain(|_, handle| !handle.join.is_finished());

        if workers.contains_key(&camera.id) {
            tracing::debug!(camera_id = camera.id, "camera already streaming");
            return Ok(false);
        }
        if workers.len() >= self.max_streams {
            return Err(WorkerManagerError::LimitReached(self.max_streams));
        }

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(WorkerStatus::offline());
        let join = tokio::spawn(run_worker(
            self.ctx.clone(),
            camera.clone(),
            cancel.clone(),
            status_tx,
        ));

        workers.insert(
            camera.id,
            WorkerHandle {
                room_id: camera.room_id,
                cancel,
                join,
                status: status_rx,
            },
        );
        tracing::info!(
            camera_id = camera.id,
            active = workers.len(),
            "camera worker started"
        );
        Ok(true)
    }

    /// Stop one camera's worker. Bounded by the shutdown grace: a worker
    /// that does not exit cooperatively in time is aborted.
    pub async fn stop(&self, camera_id: i64) -> bool {
        let handle = self.workers.lock().await.remove(&camera_id);
        let Some(handle) = handle else {
            return false;
        };
        self.shut_down(camera_id, handle).await;
        true
    }

    async fn shut_down(&self, camera_id: i64, mut handle: WorkerHandle) {
        handle.cancel.cancel();
        match tokio::time::timeout(self.shutdown_grace, &mut handle.join).await {
            Ok(_) => tracing::info!(camera_id, "camera worker stopped"),
            Err(_) => {
                tracing::warn!(camera_id, "worker missed shutdown grace; aborting");
                handle.join.abort();
            }
        }
    }

    /// Stop every camera in one room; returns how many were stopped.
    pub async fn stop_room(&self, room_id: i64) -> usize {
        let to_stop: Vec<i64> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .filter(|(_, handle)| handle.room_id == room_id)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut stopped = 0;
        for camera_id in to_stop {
            if self.stop(camera_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop everything (daemon shutdown).
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.workers.lock().await.keys().copied().collect();
        for camera_id in ids {
            self.stop(camera_id).await;
        }
    }

    pub async fn status(&self, camera_id: i64) -> Option<WorkerStatus> {
        let workers = self.workers.lock().await;
        workers.get(&camera_id).map(|h| h.status.borrow().clone())
    }

    pub async fn is_active(&self, camera_id: i64) -> bool {
        let workers = self.workers.lock().await;
        workers
            .get(&camera_id)
            .is_some_and(|h| !h.join.is_finished())
    }

    pub async fn active_count(&self) -> usize {
        let workers = self.workers.lock().await;
        workers.values().filter(|h| !h.join.is_finished()).count()
    }
}
