//! Raw inbound messages and the allow-list projection applied before storage.
//!
//! Upstream writers send unordered key/value documents. Only the fields named
//! in [`JOB_EVENT_FIELDS`] / [`AD_HOC_EVENT_FIELDS`] ever reach the store.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::events::EventKind;
use crate::ids::{AdHocCommandId, EventOwner, JobId};

pub type Fields = serde_json::Map<String, Value>;

pub const JOB_EVENT_FIELDS: &[&str] = &["job_id", "event", "event_data", "created", "counter"];
pub const AD_HOC_EVENT_FIELDS: &[&str] =
    &["ad_hoc_command_id", "event", "event_data", "created", "counter"];

/// A message that carried the minimum fields needed to be routed.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEvent {
    pub owner: EventOwner,
    pub kind: EventKind,
    pub fields: Fields,
}

impl InboundEvent {
    /// Classify a raw message. Returns `None` when the `event` discriminator
    /// or both owner identifiers are missing; such messages are dropped.
    ///
    /// An `ad_hoc_command_id` wins over `job_id` when both are present.
    pub fn classify(fields: Fields) -> Option<Self> {
        let kind = EventKind::from(fields.get("event")?.as_str()?);
        let owner = if let Some(id) = fields.get("ad_hoc_command_id").and_then(as_id) {
            EventOwner::AdHoc(AdHocCommandId::new(id))
        } else {
            EventOwner::Job(JobId::new(fields.get("job_id").and_then(as_id)?))
        };
        Some(Self { owner, kind, fields })
    }

    pub fn counter(&self) -> Option<i64> {
        self.fields.get("counter").and_then(as_id)
    }

    pub fn allowed_fields(&self) -> &'static [&'static str] {
        match self.owner {
            EventOwner::Job(_) => JOB_EVENT_FIELDS,
            EventOwner::AdHoc(_) => AD_HOC_EVENT_FIELDS,
        }
    }
}

/// Keep only the allow-listed top-level keys.
pub fn project(fields: Fields, allowed: &[&str]) -> Fields {
    fields
        .into_iter()
        .filter(|(key, _)| allowed.contains(&key.as_str()))
        .collect()
}

/// Parse the `created` timestamp. Accepts RFC 3339 and naive ISO-8601
/// (interpreted as UTC). Anything else yields `None`.
pub fn parse_created(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Integer identifiers may arrive as numbers or numeric strings.
pub fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
