use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use relay_core::fields::{parse_created, project};
use relay_core::redact::strip_invocation_args;
use relay_core::{EventOwner, EventRowId, InboundEvent, Verbosity};
use relay_store::{EventRow, EventStore, NewEvent};

/// Persist one event as a single transaction.
///
/// Runs the allow-list projection, redacts invocation arguments for
/// lowest-verbosity runs and falls back to the insert time for an unparseable
/// `created`. Store faults are logged and reported as `None`; they never stop
/// the pipeline.
pub fn persist_event(
    store: &dyn EventStore,
    event: InboundEvent,
    parent: Option<EventRowId>,
) -> Option<EventRow> {
    let counter = event.counter();
    let allowed = event.allowed_fields();
    let InboundEvent { owner, kind, fields } = event;
    let mut fields = project(fields, allowed);

    let verbosity = store.verbosity(owner).unwrap_or_else(|e| {
        debug!(owner = %owner, error = %e, "verbosity lookup failed, assuming lowest");
        Verbosity::LOWEST
    });

    let mut event_data = fields
        .remove("event_data")
        .unwrap_or_else(|| Value::Object(Default::default()));
    if verbosity.is_lowest() && strip_invocation_args(&mut event_data) {
        debug!(owner = %owner, "stripped invocation arguments");
    }

    let created = fields.get("created").and_then(parse_created);
    let new_event = NewEvent::new(kind, event_data)
        .with_counter(counter)
        .with_created(created);

    let result = match owner {
        EventOwner::Job(job_id) => store.insert_job_event(job_id, parent, new_event),
        EventOwner::AdHoc(id) => store.insert_ad_hoc_event(id, new_event),
    };
    match result {
        Ok(row) => Some(row),
        Err(e) => {
            error!(owner = %owner, error = %e, "failed to persist event");
            None
        }
    }
}

/// [`persist_event`] on the blocking pool, so SQLite never stalls the runtime.
pub async fn persist_blocking(
    store: Arc<dyn EventStore>,
    event: InboundEvent,
    parent: Option<EventRowId>,
) -> Option<EventRow> {
    match tokio::task::spawn_blocking(move || persist_event(store.as_ref(), event, parent)).await {
        Ok(row) => row,
        Err(e) => {
            error!(error = %e, "persist task failed");
            None
        }
    }
}
