//! Columns derived from an event payload at insert time.

use serde_json::Value;

use crate::events::EventKind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventColumns {
    pub kind: EventKind,
    pub failed: bool,
    pub changed: bool,
    pub host_name: String,
    pub play: String,
    pub task: String,
}

/// Compute the stored kind, flags and context strings for an event.
pub fn derive_columns(kind: &EventKind, event_data: &Value) -> EventColumns {
    let res = event_data.get("res");
    let kind = correct_async_kind(kind, res);

    let mut failed = kind.is_failure() && !truthy(event_data.get("ignore_errors"));
    let mut changed = res.and_then(|r| r.get("changed")).map_or(false, |c| truthy(Some(c)));

    if kind.is_terminal() {
        failed = sum_counts(event_data.get("failures")) + sum_counts(event_data.get("dark")) > 0;
        changed = sum_counts(event_data.get("changed")) > 0;
    }

    EventColumns {
        failed,
        changed,
        host_name: string_field(event_data, "host"),
        play: string_field(event_data, "play"),
        task: string_field(event_data, "task"),
        kind,
    }
}

/// `runner_on_async_ok` is sometimes emitted for a failed async task.
fn correct_async_kind(kind: &EventKind, res: Option<&Value>) -> EventKind {
    if kind.as_str() != "runner_on_async_ok" {
        return kind.clone();
    }
    let failed = res.and_then(|r| r.get("failed")).map_or(false, |f| truthy(Some(f)));
    let rc = res.and_then(|r| r.get("rc")).and_then(Value::as_i64).unwrap_or(0);
    if failed || rc != 0 {
        EventKind::Runner("runner_on_async_failed".to_owned())
    } else {
        kind.clone()
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}

/// Sum the per-host counters of a stats map; non-map values count as zero.
fn sum_counts(value: Option<&Value>) -> i64 {
    value
        .and_then(Value::as_object)
        .map(|hosts| hosts.values().filter_map(Value::as_i64).sum())
        .unwrap_or(0)
}

fn string_field(event_data: &Value, key: &str) -> String {
    event_data
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_kind_sets_failed() {
        let d = derive_columns(&EventKind::from("runner_on_failed"), &json!({"host": "web1"}));
        assert!(d.failed);
        assert!(!d.changed);
        assert_eq!(d.host_name, "web1");
    }

    #[test]
    fn ignore_errors_suppresses_failed() {
        let d = derive_columns(
            &EventKind::from("runner_on_failed"),
            &json!({"ignore_errors": true}),
        );
        assert!(!d.failed);
    }

    #[test]
    fn changed_from_result() {
        let d = derive_columns(
            &EventKind::from("runner_on_ok"),
            &json!({"res": {"changed": true}, "task": "install", "play": "site"}),
        );
        assert!(d.changed);
        assert_eq!(d.task, "install");
        assert_eq!(d.play, "site");
    }

    #[test]
    fn async_ok_with_nonzero_rc_becomes_failed() {
        let d = derive_columns(&EventKind::from("runner_on_async_ok"), &json!({"res": {"rc": 2}}));
        assert_eq!(d.kind.as_str(), "runner_on_async_failed");
        assert!(d.failed);

        let ok = derive_columns(&EventKind::from("runner_on_async_ok"), &json!({"res": {"rc": 0}}));
        assert_eq!(ok.kind.as_str(), "runner_on_async_ok");
        assert!(!ok.failed);
    }

    #[test]
    fn stats_flags_from_counters() {
        let d = derive_columns(
            &EventKind::Stats,
            &json!({"failures": {"web1": 0}, "dark": {"web2": 1}, "changed": {"web1": 0}}),
        );
        assert!(d.failed);
        assert!(!d.changed);

        let clean = derive_columns(&EventKind::Stats, &json!({"failures": "garbled", "changed": {"a": 3}}));
        assert!(!clean.failed);
        assert!(clean.changed);
    }
}
