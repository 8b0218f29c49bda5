//! Fixed set of workers that persist chat messages off the broadcast path.
//!
//! Submission never waits. When the queue is full the job is rejected and only
//! that message's durability is lost; its broadcast has already gone out.

use std::sync::{Arc, Mutex, PoisonError};

use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::store::{Message, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("persistence queue is full")]
    QueueFull,
    #[error("persistence pool is closed")]
    Closed,
}

pub struct WorkerPool {
    queue: Mutex<Option<Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks sharing one queue of `capacity` jobs.
    pub fn spawn(workers: usize, capacity: usize, store: Arc<Store>) -> Self {
        let (queue, jobs) = flume::bounded(capacity);
        let handles = (0..workers)
            .map(|worker| tokio::spawn(run_worker(worker, jobs.clone(), Arc::clone(&store))))
            .collect();
        info!(workers, capacity, "persistence pool started");
        Self::from_parts(queue, handles)
    }

    pub(crate) fn from_parts(queue: Sender<Message>, workers: Vec<JoinHandle<()>>) -> Self {
        Self {
            queue: Mutex::new(Some(queue)),
            workers: Mutex::new(workers),
        }
    }

    pub fn submit(&self, message: Message) -> Result<(), SubmitError> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = queue.as_ref() else {
            return Err(SubmitError::Closed);
        };
        queue.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Disconnected(_) => SubmitError::Closed,
        })
    }

    /// Closes the queue and waits for the workers to finish what was queued.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *workers)
        };

        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = ?err, "persistence worker failed");
            }
        }
        info!("persistence pool drained");
    }
}

async fn run_worker(worker: usize, jobs: Receiver<Message>, store: Arc<Store>) {
    while let Ok(message) = jobs.recv_async().await {
        let store = Arc::clone(&store);
        let id = message.id.clone();
        match tokio::task::spawn_blocking(move || store.append_message(message)).await {
            Ok(()) => debug!(worker, message = %id, "message persisted"),
            Err(err) => error!(worker, message = %id, error = ?err, "persistence job failed"),
        }
    }
    debug!(worker, "persistence worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(content: &str) -> Message {
        Message::compose("id-alice", "alice", content.to_string())
    }

    #[tokio::test]
    async fn shutdown_drains_queued_jobs() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(dir.path()).expect("open store"));
        let pool = WorkerPool::spawn(2, 64, Arc::clone(&store));

        for n in 0..20 {
            pool.submit(message(&format!("message {n}"))).expect("submit");
        }
        pool.shutdown().await;

        assert_eq!(store.message_count(), 20);
        assert_eq!(Store::open(dir.path()).expect("reopen").message_count(), 20);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let (queue, jobs) = flume::bounded(1);
        let pool = WorkerPool::from_parts(queue, Vec::new());

        assert_eq!(pool.submit(message("first")), Ok(()));
        assert_eq!(pool.submit(message("second")), Err(SubmitError::QueueFull));
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(dir.path()).expect("open store"));
        let pool = WorkerPool::spawn(1, 4, store);

        pool.shutdown().await;
        assert_eq!(pool.submit(message("late")), Err(SubmitError::Closed));
    }
}
