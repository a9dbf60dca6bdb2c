use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use relay_core::columns::derive_columns;
use relay_core::{AdHocCommandId, EventKind, EventOwner, EventRowId, JobId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// An event ready to be written. Allow-listing and redaction happen before this point.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub kind: EventKind,
    pub event_data: Value,
    pub counter: Option<i64>,
    /// `None` means "stamp with the insert time".
    pub created: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn new(kind: EventKind, event_data: Value) -> Self {
        Self {
            kind,
            event_data,
            counter: None,
            created: None,
        }
    }

    pub fn with_counter(mut self, counter: Option<i64>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_created(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self
    }
}

/// A stored job or ad-hoc command event row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: EventRowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ad_hoc_command_id: Option<AdHocCommandId>,
    #[serde(default)]
    pub parent_id: Option<EventRowId>,
    pub event: String,
    pub event_data: Value,
    pub failed: bool,
    pub changed: bool,
    pub host_name: String,
    #[serde(default)]
    pub play: String,
    #[serde(default)]
    pub task: String,
    pub counter: Option<i64>,
    pub created: String,
    pub modified: String,
}

impl EventRow {
    pub fn owner(&self) -> Option<EventOwner> {
        match (self.job_id, self.ad_hoc_command_id) {
            (_, Some(id)) => Some(EventOwner::AdHoc(id)),
            (Some(id), None) => Some(EventOwner::Job(id)),
            (None, None) => None,
        }
    }
}

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a job event in one transaction:
    /// 1. Resolves `parent` to a stored row (a dangling id is left unlinked)
    /// 2. Inserts the row with its derived columns
    /// 3. Propagates `failed`/`changed` up the parent chain
    #[instrument(skip(self, event), fields(job_id = %job_id, event = %event.kind))]
    pub fn insert_job_event(
        &self,
        job_id: JobId,
        parent: Option<EventRowId>,
        event: NewEvent,
    ) -> Result<EventRow, StoreError> {
        let columns = derive_columns(&event.kind, &event.event_data);
        let now = Utc::now();
        let created = event.created.unwrap_or(now).to_rfc3339();
        let modified = now.to_rfc3339();
        let event_data = serde_json::to_string(&event.event_data)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let parent_id = match parent {
                Some(candidate) => {
                    let found = tx
                        .query_row(
                            "SELECT id FROM job_events WHERE id = ?1",
                            [candidate.get()],
                            |row| row.get::<_, i64>(0),
                        )
                        .optional()?
                        .map(EventRowId::new);
                    if found.is_none() {
                        debug!(parent = %candidate, "parent row not found, leaving event unlinked");
                    }
                    found
                }
                None => None,
            };

            tx.execute(
                "INSERT INTO job_events
                     (job_id, parent_id, event, event_data, failed, changed, host_name, play, task, counter, created, modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    job_id.get(),
                    parent_id.map(EventRowId::get),
                    columns.kind.as_str(),
                    event_data,
                    columns.failed,
                    columns.changed,
                    columns.host_name,
                    columns.play,
                    columns.task,
                    event.counter,
                    created,
                    modified,
                ],
            )?;
            let id = EventRowId::new(tx.last_insert_rowid());

            propagate_flags(&tx, parent_id, columns.failed, columns.changed)?;
            tx.commit()?;

            Ok(EventRow {
                id,
                job_id: Some(job_id),
                ad_hoc_command_id: None,
                parent_id,
                event: columns.kind.as_str().to_owned(),
                event_data: event.event_data,
                failed: columns.failed,
                changed: columns.changed,
                host_name: columns.host_name,
                play: columns.play,
                task: columns.task,
                counter: event.counter,
                created,
                modified,
            })
        })
    }

    /// Insert an ad-hoc command event. These rows are flat and never linked.
    #[instrument(skip(self, event), fields(ad_hoc_command_id = %id, event = %event.kind))]
    pub fn insert_ad_hoc_event(&self, id: AdHocCommandId, event: NewEvent) -> Result<EventRow, StoreError> {
        let columns = derive_columns(&event.kind, &event.event_data);
        let now = Utc::now();
        let created = event.created.unwrap_or(now).to_rfc3339();
        let modified = now.to_rfc3339();
        let event_data = serde_json::to_string(&event.event_data)?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO ad_hoc_command_events
                     (ad_hoc_command_id, event, event_data, failed, changed, host_name, counter, created, modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.get(),
                    columns.kind.as_str(),
                    event_data,
                    columns.failed,
                    columns.changed,
                    columns.host_name,
                    event.counter,
                    created,
                    modified,
                ],
            )?;
            let row_id = EventRowId::new(tx.last_insert_rowid());
            tx.commit()?;

            Ok(EventRow {
                id: row_id,
                job_id: None,
                ad_hoc_command_id: Some(id),
                parent_id: None,
                event: columns.kind.as_str().to_owned(),
                event_data: event.event_data,
                failed: columns.failed,
                changed: columns.changed,
                host_name: columns.host_name,
                play: String::new(),
                task: String::new(),
                counter: event.counter,
                created,
                modified,
            })
        })
    }

    #[instrument(skip(self), fields(event_id = %id))]
    pub fn get_job_event(&self, id: EventRowId) -> Result<EventRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{JOB_EVENT_SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => row_to_job_event(row),
                None => Err(StoreError::NotFound(format!("job event {id}"))),
            }
        })
    }

    /// List a job's events in insertion order.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn list_job_events(&self, job_id: JobId) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{JOB_EVENT_SELECT} WHERE job_id = ?1 ORDER BY id ASC"))?;
            let mut rows = stmt.query([job_id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_job_event(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(ad_hoc_command_id = %id))]
    pub fn list_ad_hoc_events(&self, id: AdHocCommandId) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ad_hoc_command_id, event, event_data, failed, changed, host_name, counter, created, modified
                 FROM ad_hoc_command_events WHERE ad_hoc_command_id = ?1 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_ad_hoc_event(row)?);
            }
            Ok(results)
        })
    }

    pub fn count_job_events(&self, job_id: JobId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM job_events WHERE job_id = ?1",
                [job_id.get()],
                |row| row.get(0),
            )?)
        })
    }
}

/// Walk up from `next`, OR-ing the flags into each ancestor. A flag stops
/// travelling at the first ancestor that already carries it.
fn propagate_flags(
    conn: &Connection,
    mut next: Option<EventRowId>,
    mut failed: bool,
    mut changed: bool,
) -> Result<(), StoreError> {
    while let Some(id) = next {
        if !failed && !changed {
            break;
        }
        let (parent, was_failed, was_changed): (Option<i64>, bool, bool) = conn.query_row(
            "SELECT parent_id, failed, changed FROM job_events WHERE id = ?1",
            [id.get()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        failed &= !was_failed;
        changed &= !was_changed;
        if failed || changed {
            conn.execute(
                "UPDATE job_events SET failed = (failed OR ?1), changed = (changed OR ?2) WHERE id = ?3",
                rusqlite::params![failed, changed, id.get()],
            )?;
        }
        next = parent.map(EventRowId::new);
    }
    Ok(())
}

const JOB_EVENT_SELECT: &str = "SELECT id, job_id, parent_id, event, event_data, failed, changed, host_name, play, task, counter, created, modified FROM job_events";

fn row_to_job_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let raw: String = row_helpers::get(row, 4, "job_events", "event_data")?;
    Ok(EventRow {
        id: EventRowId::new(row_helpers::get(row, 0, "job_events", "id")?),
        job_id: Some(JobId::new(row_helpers::get(row, 1, "job_events", "job_id")?)),
        ad_hoc_command_id: None,
        parent_id: row_helpers::get_opt::<i64>(row, 2, "job_events", "parent_id")?.map(EventRowId::new),
        event: row_helpers::get(row, 3, "job_events", "event")?,
        event_data: row_helpers::parse_json(&raw, "job_events", "event_data")?,
        failed: row_helpers::get(row, 5, "job_events", "failed")?,
        changed: row_helpers::get(row, 6, "job_events", "changed")?,
        host_name: row_helpers::get(row, 7, "job_events", "host_name")?,
        play: row_helpers::get(row, 8, "job_events", "play")?,
        task: row_helpers::get(row, 9, "job_events", "task")?,
        counter: row_helpers::get_opt(row, 10, "job_events", "counter")?,
        created: row_helpers::get(row, 11, "job_events", "created")?,
        modified: row_helpers::get(row, 12, "job_events", "modified")?,
    })
}

fn row_to_ad_hoc_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    const TABLE: &str = "ad_hoc_command_events";
    let raw: String = row_helpers::get(row, 3, TABLE, "event_data")?;
    Ok(EventRow {
        id: EventRowId::new(row_helpers::get(row, 0, TABLE, "id")?),
        job_id: None,
        ad_hoc_command_id: Some(AdHocCommandId::new(row_helpers::get(row, 1, TABLE, "ad_hoc_command_id")?)),
        parent_id: None,
        event: row_helpers::get(row, 2, TABLE, "event")?,
        event_data: row_helpers::parse_json(&raw, TABLE, "event_data")?,
        failed: row_helpers::get(row, 4, TABLE, "failed")?,
        changed: row_helpers::get(row, 5, TABLE, "changed")?,
        host_name: row_helpers::get(row, 6, TABLE, "host_name")?,
        play: String::new(),
        task: String::new(),
        counter: row_helpers::get_opt(row, 7, TABLE, "counter")?,
        created: row_helpers::get(row, 8, TABLE, "created")?,
        modified: row_helpers::get(row, 9, TABLE, "modified")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JOB: JobId = JobId::new(7);

    fn repo() -> EventRepo {
        EventRepo::new(Database::in_memory().unwrap())
    }

    fn insert(repo: &EventRepo, kind: &str, parent: Option<EventRowId>, data: Value) -> EventRow {
        repo.insert_job_event(JOB, parent, NewEvent::new(EventKind::from(kind), data))
            .unwrap()
    }

    #[test]
    fn insert_links_existing_parent() {
        let repo = repo();
        let task = insert(&repo, "playbook_on_task_start", None, json!({"task": "ping"}));
        let ok = insert(&repo, "runner_on_ok", Some(task.id), json!({"host": "web1"}));

        assert_eq!(ok.parent_id, Some(task.id));
        assert_eq!(ok.host_name, "web1");
        let fetched = repo.get_job_event(ok.id).unwrap();
        assert_eq!(fetched, ok);
    }

    #[test]
    fn dangling_parent_is_left_unlinked() {
        let repo = repo();
        let row = insert(&repo, "runner_on_ok", Some(EventRowId::new(999)), json!({}));
        assert!(row.parent_id.is_none());
    }

    #[test]
    fn created_falls_back_to_insert_time() {
        let repo = repo();
        let row = insert(&repo, "playbook_on_start", None, json!({}));
        assert_eq!(row.created, row.modified);

        let created = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        let row = repo
            .insert_job_event(
                JOB,
                None,
                NewEvent::new(EventKind::PlaybookStart, json!({})).with_created(Some(created)).with_counter(Some(1)),
            )
            .unwrap();
        assert!(row.created.starts_with("2020-01-02T03:04:05"));
        assert_eq!(row.counter, Some(1));
    }

    #[test]
    fn flags_propagate_up_the_chain() {
        let repo = repo();
        let run = insert(&repo, "playbook_on_start", None, json!({}));
        let play = insert(&repo, "playbook_on_play_start", Some(run.id), json!({}));
        let task = insert(&repo, "playbook_on_task_start", Some(play.id), json!({}));
        insert(&repo, "runner_on_failed", Some(task.id), json!({"res": {"changed": true}}));

        for id in [run.id, play.id, task.id] {
            let row = repo.get_job_event(id).unwrap();
            assert!(row.failed, "{} not failed", row.event);
            assert!(row.changed, "{} not changed", row.event);
        }
    }

    #[test]
    fn ignored_failure_does_not_propagate() {
        let repo = repo();
        let task = insert(&repo, "playbook_on_task_start", None, json!({}));
        let row = insert(&repo, "runner_on_failed", Some(task.id), json!({"ignore_errors": true}));
        assert!(!row.failed);
        assert!(!repo.get_job_event(task.id).unwrap().failed);
    }

    #[test]
    fn flagged_parent_stops_the_walk() {
        let repo = repo();
        let run = insert(&repo, "playbook_on_start", None, json!({}));
        let task = insert(&repo, "playbook_on_task_start", Some(run.id), json!({}));
        repo.db
            .with_conn(|conn| {
                conn.execute("UPDATE job_events SET changed = 1 WHERE id = ?1", [task.id.get()])?;
                Ok(())
            })
            .unwrap();

        insert(&repo, "runner_on_ok", Some(task.id), json!({"res": {"changed": true}}));
        assert!(!repo.get_job_event(run.id).unwrap().changed);
    }

    #[test]
    fn async_ok_with_failure_is_stored_as_failed() {
        let repo = repo();
        let row = insert(&repo, "runner_on_async_ok", None, json!({"res": {"rc": 2}}));
        assert_eq!(row.event, "runner_on_async_failed");
        assert!(row.failed);
    }

    #[test]
    fn ad_hoc_events_are_flat() {
        let repo = repo();
        let id = AdHocCommandId::new(3);
        let row = repo
            .insert_ad_hoc_event(id, NewEvent::new(EventKind::from("runner_on_ok"), json!({"host": "db1"})))
            .unwrap();
        assert_eq!(row.owner(), Some(EventOwner::AdHoc(id)));
        assert!(row.parent_id.is_none());

        let listed = repo.list_ad_hoc_events(id).unwrap();
        assert_eq!(listed, vec![row]);
        assert_eq!(repo.count_job_events(JOB).unwrap(), 0);
    }

    #[test]
    fn serialized_row_omits_other_owner() {
        let repo = repo();
        let row = insert(&repo, "playbook_on_start", None, json!({}));
        let wire = serde_json::to_value(&row).unwrap();
        assert_eq!(wire["job_id"], 7);
        assert!(wire.get("ad_hoc_command_id").is_none());
    }
}
