use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Module name used when a fact message does not name one.
pub const DEFAULT_FACT_MODULE: &str = "ansible";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactRow {
    pub inventory_id: i64,
    pub host: String,
    pub module: String,
    pub facts: Value,
    pub modified: String,
}

/// Cached host facts, one row per `(inventory_id, host, module)`.
pub struct FactRepo {
    db: Database,
}

impl FactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the facts for a host and bump `modified`.
    #[instrument(skip(self, facts))]
    pub fn upsert(
        &self,
        inventory_id: i64,
        host: &str,
        module: &str,
        facts: Value,
    ) -> Result<FactRow, StoreError> {
        let modified = Utc::now().to_rfc3339();
        let raw = serde_json::to_string(&facts)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fact_cache (inventory_id, host, module, facts, modified)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (inventory_id, host, module)
                 DO UPDATE SET facts = excluded.facts, modified = excluded.modified",
                rusqlite::params![inventory_id, host, module, raw, modified],
            )?;
            Ok(())
        })?;
        Ok(FactRow {
            inventory_id,
            host: host.to_owned(),
            module: module.to_owned(),
            facts,
            modified,
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, inventory_id: i64, host: &str, module: &str) -> Result<Option<FactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT inventory_id, host, module, facts, modified FROM fact_cache
                 WHERE inventory_id = ?1 AND host = ?2 AND module = ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![inventory_id, host, module])?;
            match rows.next()? {
                Some(row) => row_to_fact(row).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn count(&self, inventory_id: i64) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM fact_cache WHERE inventory_id = ?1",
                [inventory_id],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> Result<FactRow, StoreError> {
    let raw: String = row_helpers::get(row, 3, "fact_cache", "facts")?;
    Ok(FactRow {
        inventory_id: row_helpers::get(row, 0, "fact_cache", "inventory_id")?,
        host: row_helpers::get(row, 1, "fact_cache", "host")?,
        module: row_helpers::get(row, 2, "fact_cache", "module")?,
        facts: row_helpers::parse_json(&raw, "fact_cache", "facts")?,
        modified: row_helpers::get(row, 4, "fact_cache", "modified")?,
    })
}
