//! Registry of sampling workers.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use log::{debug, info};

use super::queue::SampleQueue;
use super::worker::{SamplingWorker, WorkerExit, WorkerState, join};

/// Owns every [`SamplingWorker`], keyed by command signature.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Mutex<IndexMap<String, SamplingWorker>>,
    join_timeout: Duration,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Create an empty pool that waits up to 5 seconds per worker on stop.
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(IndexMap::new()),
            join_timeout: Duration::from_secs(5),
        }
    }

    /// Set how long [`stop_all`](Self::stop_all) waits for each worker.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    fn workers(&self) -> MutexGuard<'_, IndexMap<String, SamplingWorker>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register and start `worker`.
    ///
    /// If a worker with the same signature exists, that one is started
    /// instead and `worker` is dropped. A registered worker that failed for
    /// good, or whose previous task is still finishing, is left as it is.
    /// Returns the registered worker's queue.
    pub fn add(&self, mut worker: SamplingWorker) -> SampleQueue {
        let signature = worker.signature();
        let mut workers = self.workers();

        if let Some(existing) = workers.get_mut(&signature) {
            match existing.state() {
                WorkerState::Failed => {
                    debug!("Worker {} already failed, not restarting", signature)
                }
                _ if existing.is_running() => debug!("Worker {} still running", signature),
                _ => {
                    debug!("Worker {} already registered, starting it", signature);
                    existing.start();
                }
            }
            return existing.queue();
        }

        worker.start();
        let queue = worker.queue();
        info!("Registered worker {}", signature);
        workers.insert(signature, worker);
        queue
    }

    /// Queue of the worker registered under `signature`.
    pub fn queue(&self, signature: &str) -> Option<SampleQueue> {
        self.workers().get(signature).map(SamplingWorker::queue)
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.workers().contains_key(signature)
    }

    /// Registered signatures, in registration order.
    pub fn signatures(&self) -> Vec<String> {
        self.workers().keys().cloned().collect()
    }

    /// State of every worker, in registration order.
    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.workers()
            .iter()
            .map(|(signature, worker)| (signature.clone(), worker.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers().is_empty()
    }

    /// Signal every worker, then wait for them concurrently.
    ///
    /// A worker still busy after the join timeout is logged and left to
    /// finish on its own. Returns each worker's exit, `None` if it did not
    /// join.
    pub async fn stop_all(&self) -> Vec<(String, Option<WorkerExit>)> {
        let handles: Vec<_> = {
            let mut workers = self.workers();
            workers
                .iter_mut()
                .filter_map(|(signature, worker)| {
                    worker.stop();
                    worker.take_handle().map(|handle| (signature.clone(), handle))
                })
                .collect()
        };

        if handles.is_empty() {
            return Vec::new();
        }
        info!("Stopping {} worker(s)", handles.len());

        let timeout = self.join_timeout;
        join_all(handles.into_iter().map(|(signature, handle)| async move {
            let exit = join(&signature, handle, timeout).await;
            (signature, exit)
        }))
        .await
    }

    /// Stop every worker and forget them.
    pub async fn reset(&self) {
        self.stop_all().await;
        self.workers().clear();
    }
}
