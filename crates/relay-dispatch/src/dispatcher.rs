use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use relay_core::{EventOwner, EventRowId, Fields, InboundEvent};
use relay_settings::RelaySettings;
use relay_store::{EventRow, EventStore};
use relay_transport::{Channel, Listener, PublisherConfig};

use crate::anchors::AnchorTable;
use crate::error::DispatchError;
use crate::notifier::{Notifier, NotifyTarget};
use crate::persist::persist_blocking;
use crate::pool::{PoolConfig, WorkItem, WorkerPool};

/// What happened to one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// Missing `event` or an owner id; dropped on purpose.
    Dropped,
    /// Persisted by the dispatcher itself. `None` if the store refused it.
    Inline(Option<EventRowId>),
    /// Handed to a worker queue.
    Queued { worker: usize },
}

/// Classifies every inbound event, persists anchors and terminal events
/// inline and routes the rest to the worker pool.
///
/// The anchor table and routing counters live here and nowhere else.
pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    anchors: AnchorTable,
    pool: WorkerPool,
    notifier: Notifier,
    routed: u64,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn EventStore>, pool: WorkerPool, notifier: Notifier) -> Self {
        Self {
            store,
            anchors: AnchorTable::new(),
            pool,
            notifier,
            routed: 0,
        }
    }

    pub fn anchors(&self) -> &AnchorTable {
        &self.anchors
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Handle one raw message.
    ///
    /// Anchors are durable and recorded before the next message is read, so
    /// any later event of the same job resolves its parent against them.
    pub async fn handle(&mut self, fields: Fields) -> Result<Handled, DispatchError> {
        let Some(event) = InboundEvent::classify(fields) else {
            trace!("dropping message without event kind or owner id");
            return Ok(Handled::Dropped);
        };

        let job_id = match event.owner {
            EventOwner::AdHoc(_) => {
                let row = self.persist_inline(event, None).await;
                return Ok(Handled::Inline(row));
            }
            EventOwner::Job(job_id) => job_id,
        };

        let parent = self.anchors.resolve_parent(job_id, &event.kind);

        if let Some(anchor) = event.kind.anchor() {
            let row = self.persist_inline(event, parent).await;
            match row {
                Some(id) => self.anchors.record(job_id, anchor, id),
                // Later events must not hang under the previous anchor of this kind.
                None => self.anchors.forget(job_id, anchor),
            }
            return Ok(Handled::Inline(row));
        }

        if event.kind.is_terminal() {
            let row = self.persist_inline(event, parent).await;
            self.anchors.evict(job_id);
            debug!(job_id = %job_id, "job finished, anchors evicted");
            return Ok(Handled::Inline(row));
        }

        let preferred = (self.routed % self.pool.len() as u64) as usize;
        self.routed += 1;
        let worker = self.pool.route(WorkItem { event, parent }, preferred).await?;
        Ok(Handled::Queued { worker })
    }

    async fn persist_inline(&mut self, event: InboundEvent, parent: Option<EventRowId>) -> Option<EventRowId> {
        let row: Option<EventRow> = persist_blocking(self.store.clone(), event, parent).await;
        let row = row?;
        self.notifier.notify(&row).await;
        Some(row.id)
    }

    /// Receive until cancelled, running the health check on every tick.
    ///
    /// Each message is acknowledged only after it has been persisted or
    /// queued. Returns `AllQueuesFull` immediately; the pool is still shut
    /// down first.
    pub async fn run(
        mut self,
        mut listener: Listener,
        health_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        let start = tokio::time::Instant::now() + health_interval;
        let mut health = tokio::time::interval_at(start, health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            addr = %listener.local_addr(),
            workers = self.pool.len(),
            notifications = self.notifier.is_enabled(),
            "dispatcher running"
        );

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = health.tick() => {
                    let respawned = self.pool.check_health().await;
                    if respawned > 0 {
                        info!(respawned, "respawned workers");
                    }
                }
                message = listener.recv::<Fields>() => match message {
                    Some(fields) => {
                        if let Err(e) = self.handle(fields).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        match outcome {
            Ok(()) => listener.close(),
            // The message that could not be queued stays unacknowledged.
            Err(_) => drop(listener),
        }
        let stopped = self.pool.shutdown().await;
        outcome.and(stopped)
    }
}

/// Bind the callback channel and run a dispatcher with its pool until `cancel` fires.
pub async fn run_dispatcher(
    settings: &RelaySettings,
    store: Arc<dyn EventStore>,
    cancel: CancellationToken,
) -> Result<(), DispatchError> {
    let listener = Listener::bind(Channel::Callbacks, Channel::Callbacks.endpoint(&settings.endpoints)).await?;

    let notify = settings.dispatch.emit_notifications.then(|| NotifyTarget {
        addr: Channel::Notifications.endpoint(&settings.endpoints).to_string(),
        config: PublisherConfig::from(&settings.transport),
    });
    let pool = WorkerPool::start(
        PoolConfig::from(&settings.dispatch),
        store.clone(),
        notify.clone(),
        cancel.child_token(),
    );
    let dispatcher = Dispatcher::new(store, pool, Notifier::new(notify.as_ref()));

    dispatcher
        .run(listener, Duration::from_millis(settings.dispatch.health_interval_ms), cancel)
        .await
}
