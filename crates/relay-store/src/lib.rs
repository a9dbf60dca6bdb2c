//! # relay-store
//!
//! SQLite persistence for job events, ad-hoc events, the fact cache and the
//! auth tokens checked by the fan-out service.

pub mod database;
pub mod error;
pub mod events;
pub mod facts;
pub mod jobs;
pub mod row_helpers;
pub mod schema;
pub mod tokens;

use relay_core::{AdHocCommandId, EventOwner, EventRowId, JobId, Verbosity};

pub use database::Database;
pub use error::StoreError;
pub use events::{EventRepo, EventRow, NewEvent};
pub use facts::{FactRepo, FactRow};
pub use jobs::JobRepo;
pub use tokens::TokenRepo;

/// Row-level persistence used by the dispatcher and its workers.
///
/// Every method is one transaction; nothing spans calls.
pub trait EventStore: Send + Sync {
    fn insert_job_event(
        &self,
        job_id: JobId,
        parent: Option<EventRowId>,
        event: NewEvent,
    ) -> Result<EventRow, StoreError>;

    fn insert_ad_hoc_event(&self, id: AdHocCommandId, event: NewEvent) -> Result<EventRow, StoreError>;

    /// Verbosity requested for the run that owns an event.
    fn verbosity(&self, owner: EventOwner) -> Result<Verbosity, StoreError>;
}

/// Opaque token check used when admitting live clients.
pub trait SessionStore: Send + Sync {
    fn is_valid(&self, token: &str) -> Result<bool, StoreError>;
}

impl EventStore for Database {
    fn insert_job_event(
        &self,
        job_id: JobId,
        parent: Option<EventRowId>,
        event: NewEvent,
    ) -> Result<EventRow, StoreError> {
        EventRepo::new(self.clone()).insert_job_event(job_id, parent, event)
    }

    fn insert_ad_hoc_event(&self, id: AdHocCommandId, event: NewEvent) -> Result<EventRow, StoreError> {
        EventRepo::new(self.clone()).insert_ad_hoc_event(id, event)
    }

    fn verbosity(&self, owner: EventOwner) -> Result<Verbosity, StoreError> {
        JobRepo::new(self.clone()).verbosity(owner)
    }
}

impl SessionStore for Database {
    fn is_valid(&self, token: &str) -> Result<bool, StoreError> {
        TokenRepo::new(self.clone()).is_valid(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::EventKind;
    use serde_json::json;

    #[test]
    fn database_serves_both_store_roles() {
        let db = Database::in_memory().unwrap();
        let job = JobRepo::new(db.clone()).create_job(Verbosity::new(2)).unwrap();
        let store: &dyn EventStore = &db;

        assert_eq!(store.verbosity(EventOwner::Job(job)).unwrap().level(), 2);
        let row = store
            .insert_job_event(job, None, NewEvent::new(EventKind::PlaybookStart, json!({})))
            .unwrap();
        assert_eq!(row.owner(), Some(EventOwner::Job(job)));

        let key = TokenRepo::new(db.clone()).issue("carol", chrono::Duration::hours(1)).unwrap();
        let sessions: &dyn SessionStore = &db;
        assert!(sessions.is_valid(&key).unwrap());
        assert!(!sessions.is_valid("forged").unwrap());
    }
}
