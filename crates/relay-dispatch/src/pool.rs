use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{EventRowId, InboundEvent};
use relay_settings::DispatchSettings;
use relay_store::EventStore;

use crate::error::DispatchError;
use crate::notifier::{Notifier, NotifyTarget};
use crate::worker::{run_worker, WorkerContext, WorkerExit};

/// An event handed to a worker, with its parent already resolved.
#[derive(Debug)]
pub struct WorkItem {
    pub event: InboundEvent,
    pub parent: Option<EventRowId>,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub pop_timeout: Duration,
    pub recycle_after: u64,
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for PoolConfig {
    fn from(s: &DispatchSettings) -> Self {
        Self {
            workers: s.workers.max(1),
            queue_capacity: s.queue_capacity.max(1),
            enqueue_timeout: Duration::from_millis(s.enqueue_timeout_ms),
            pop_timeout: Duration::from_millis(s.pop_timeout_ms),
            recycle_after: s.recycle_after.max(1),
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
        }
    }
}

/// One worker's queue and task. The receiver outlives any single worker task,
/// so a respawned worker resumes the same queue.
struct Slot {
    sender: mpsc::Sender<WorkItem>,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    handle: Option<JoinHandle<WorkerExit>>,
    /// Advisory load counter; never affects correctness.
    sent: u64,
    restarts: u64,
}

/// Fixed-size pool of supervised worker tasks, each with its own bounded queue.
pub struct WorkerPool {
    slots: Vec<Slot>,
    store: Arc<dyn EventStore>,
    notify: Option<NotifyTarget>,
    config: PoolConfig,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create the queues and spawn one worker per queue.
    pub fn start(
        config: PoolConfig,
        store: Arc<dyn EventStore>,
        notify: Option<NotifyTarget>,
        cancel: CancellationToken,
    ) -> Self {
        let slots = (0..config.workers.max(1))
            .map(|_| {
                let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
                Slot {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                    handle: None,
                    sent: 0,
                    restarts: 0,
                }
            })
            .collect();

        let mut pool = Self {
            slots,
            store,
            notify,
            config,
            cancel,
        };
        for index in 0..pool.slots.len() {
            pool.spawn(index);
        }
        info!(workers = pool.slots.len(), queue_capacity = pool.config.queue_capacity, "worker pool started");
        pool
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Messages routed to worker `index` so far.
    pub fn sent(&self, index: usize) -> u64 {
        self.slots.get(index).map_or(0, |s| s.sent)
    }

    /// Messages currently waiting in worker `index`'s queue.
    pub fn queued(&self, index: usize) -> usize {
        self.slots
            .get(index)
            .map_or(0, |s| s.sender.max_capacity() - s.sender.capacity())
    }

    pub fn restarts(&self, index: usize) -> u64 {
        self.slots.get(index).map_or(0, |s| s.restarts)
    }

    /// Enqueue on the preferred worker, then on the others in rotation.
    ///
    /// Each candidate gets `enqueue_timeout` to accept. When none does the
    /// error is fatal for the caller: the event must not be dropped silently.
    pub async fn route(&mut self, item: WorkItem, preferred: usize) -> Result<usize, DispatchError> {
        let workers = self.slots.len();
        let mut item = item;
        for offset in 0..workers {
            let index = (preferred + offset) % workers;
            let slot = &mut self.slots[index];
            match slot.sender.send_timeout(item, self.config.enqueue_timeout).await {
                Ok(()) => {
                    slot.sent += 1;
                    return Ok(index);
                }
                Err(SendTimeoutError::Timeout(back)) | Err(SendTimeoutError::Closed(back)) => {
                    debug!(worker = index, "worker queue unavailable, trying next");
                    item = back;
                }
            }
        }
        error!(workers, "all worker queues are full");
        Err(DispatchError::AllQueuesFull { workers })
    }

    /// Respawn any worker that is gone. Returns how many were respawned.
    ///
    /// Does nothing once shutdown has begun, so a stopping worker is never
    /// brought back.
    pub async fn check_health(&mut self) -> usize {
        let mut respawned = 0;
        for index in 0..self.slots.len() {
            if self.cancel.is_cancelled() {
                break;
            }
            let finished = match &self.slots[index].handle {
                Some(handle) => handle.is_finished(),
                None => true,
            };
            if !finished {
                continue;
            }
            if let Some(handle) = self.slots[index].handle.take() {
                log_exit(index, handle.await);
            }
            self.slots[index].restarts += 1;
            self.spawn(index);
            respawned += 1;
        }
        respawned
    }

    /// Signal every worker to stop, then wait up to the shutdown grace.
    ///
    /// Workers still running at the deadline are aborted and reported.
    pub async fn shutdown(&mut self) -> Result<(), DispatchError> {
        self.cancel.cancel();
        let grace = self.config.shutdown_grace;
        let deadline = tokio::time::Instant::now() + grace;

        let mut stuck = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(mut handle) = slot.handle.take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(result) => log_exit(index, result),
                Err(_) => {
                    handle.abort();
                    stuck.push(index);
                }
            }
        }

        if stuck.is_empty() {
            info!("worker pool stopped");
            Ok(())
        } else {
            warn!(?stuck, ?grace, "workers did not stop within grace");
            Err(DispatchError::GraceExceeded { grace, stuck })
        }
    }

    fn spawn(&mut self, index: usize) {
        let ctx = WorkerContext {
            index,
            queue: self.slots[index].receiver.clone(),
            store: self.store.clone(),
            notifier: Notifier::new(self.notify.as_ref()),
            pop_timeout: self.config.pop_timeout,
            recycle_after: self.config.recycle_after,
            cancel: self.cancel.clone(),
        };
        self.slots[index].handle = Some(tokio::spawn(run_worker(ctx)));
    }

    /// Abort a worker and wait for it to die, leaving its queue untouched.
    #[cfg(test)]
    pub(crate) async fn kill_worker(&mut self, index: usize) {
        if let Some(handle) = self.slots[index].handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

fn log_exit(index: usize, result: Result<WorkerExit, tokio::task::JoinError>) {
    match result {
        Ok(WorkerExit::Recycled { handled }) => debug!(worker = index, handled, "worker recycled"),
        Ok(exit) => debug!(worker = index, ?exit, "worker exited"),
        Err(e) if e.is_panic() => error!(worker = index, "worker crashed"),
        Err(_) => warn!(worker = index, "worker was cancelled"),
    }
}
