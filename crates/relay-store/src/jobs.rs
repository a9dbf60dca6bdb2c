use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use relay_core::{AdHocCommandId, EventOwner, JobId, Verbosity};

use crate::database::Database;
use crate::error::StoreError;

/// The runs that events belong to. Only the columns event persistence reads are kept.
pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create_job(&self, verbosity: Verbosity) -> Result<JobId, StoreError> {
        self.insert("jobs", verbosity).map(JobId::new)
    }

    #[instrument(skip(self))]
    pub fn create_ad_hoc_command(&self, verbosity: Verbosity) -> Result<AdHocCommandId, StoreError> {
        self.insert("ad_hoc_commands", verbosity).map(AdHocCommandId::new)
    }

    /// Look up the verbosity of the run that owns an event.
    #[instrument(skip(self, owner), fields(owner = %owner))]
    pub fn verbosity(&self, owner: EventOwner) -> Result<Verbosity, StoreError> {
        let (table, id) = match owner {
            EventOwner::Job(id) => ("jobs", id.get()),
            EventOwner::AdHoc(id) => ("ad_hoc_commands", id.get()),
        };
        self.db.with_conn(|conn| {
            let level: Option<i64> = conn
                .query_row(&format!("SELECT verbosity FROM {table} WHERE id = ?1"), [id], |row| {
                    row.get(0)
                })
                .optional()?;
            let level = level.ok_or_else(|| StoreError::NotFound(owner.to_string()))?;
            Ok(Verbosity::new(u8::try_from(level.max(0)).unwrap_or(u8::MAX)))
        })
    }

    fn insert(&self, table: &'static str, verbosity: Verbosity) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO {table} (verbosity, created_at) VALUES (?1, ?2)"),
                rusqlite::params![verbosity.level(), now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }
}
