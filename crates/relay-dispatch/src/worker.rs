use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use relay_store::EventStore;

use crate::notifier::Notifier;
use crate::persist::persist_blocking;
use crate::pool::WorkItem;

/// Why a worker task returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Handled its quota and stepped aside for a fresh worker.
    Recycled { handled: u64 },
    /// Stopped on shutdown.
    Shutdown { handled: u64 },
    /// Every sender is gone.
    QueueClosed { handled: u64 },
}

pub(crate) struct WorkerContext {
    pub index: usize,
    pub queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    pub store: Arc<dyn EventStore>,
    pub notifier: Notifier,
    pub pop_timeout: Duration,
    pub recycle_after: u64,
    pub cancel: CancellationToken,
}

/// Pop, persist, repeat. The current item always finishes; no new item is
/// taken once shutdown is signalled.
pub(crate) async fn run_worker(mut ctx: WorkerContext) -> WorkerExit {
    let mut handled = 0u64;
    debug!(worker = ctx.index, "worker started");

    loop {
        if ctx.cancel.is_cancelled() {
            return WorkerExit::Shutdown { handled };
        }
        if handled >= ctx.recycle_after {
            info!(worker = ctx.index, handled, "worker recycling");
            return WorkerExit::Recycled { handled };
        }

        let popped = {
            let mut queue = ctx.queue.lock().await;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return WorkerExit::Shutdown { handled },
                popped = tokio::time::timeout(ctx.pop_timeout, queue.recv()) => popped,
            }
        };

        let item = match popped {
            Err(_elapsed) => continue,
            Ok(None) => return WorkerExit::QueueClosed { handled },
            Ok(Some(item)) => item,
        };

        if let Some(row) = persist_blocking(ctx.store.clone(), item.event, item.parent).await {
            ctx.notifier.notify(&row).await;
        }
        handled += 1;
    }
}
