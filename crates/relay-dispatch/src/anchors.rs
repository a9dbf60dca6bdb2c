use std::collections::HashMap;

use relay_core::events::AnchorSlots;
use relay_core::{AnchorKind, EventKind, EventRowId, JobId, ParentRule};

/// Most recent persisted anchor of each kind, per running job.
///
/// Owned by the dispatcher loop alone. An entry appears when a job's first
/// anchor is recorded and is removed when the job's stats event arrives, so
/// the table only ever holds jobs that are still running.
#[derive(Debug, Default)]
pub struct AnchorTable {
    jobs: HashMap<JobId, AnchorSlots<EventRowId>>,
}

impl AnchorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parent row for an event of `kind` in `job_id`, if its anchor is known.
    ///
    /// For host-level events the newest of the candidate anchors wins, judged
    /// by row id.
    pub fn resolve_parent(&self, job_id: JobId, kind: &EventKind) -> Option<EventRowId> {
        let slots = self.jobs.get(&job_id)?;
        match kind.parent_rule() {
            ParentRule::None => None,
            ParentRule::Anchor(anchor) => slots.get(anchor),
            ParentRule::Latest(candidates) => candidates.iter().filter_map(|c| slots.get(*c)).max(),
        }
    }

    pub fn record(&mut self, job_id: JobId, anchor: AnchorKind, row: EventRowId) {
        self.jobs.entry(job_id).or_default().set(anchor, row);
    }

    /// Drop the anchor of one kind, e.g. when its newest event failed to persist.
    pub fn forget(&mut self, job_id: JobId, anchor: AnchorKind) {
        if let Some(slots) = self.jobs.get_mut(&job_id) {
            slots.clear(anchor);
        }
    }

    /// Forget every anchor for a finished job.
    pub fn evict(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
