use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output verbosity requested for a run (0 = normal, up to 5 = `-vvvvv`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verbosity(u8);

impl Verbosity {
    pub const LOWEST: Verbosity = Verbosity(0);

    pub fn new(level: u8) -> Self {
        Self(level.min(5))
    }

    pub fn level(self) -> u8 {
        self.0
    }

    pub fn is_lowest(self) -> bool {
        self == Self::LOWEST
    }
}

/// Remove `res.invocation.module_args` from an event payload.
///
/// Returns `true` if anything was removed.
pub fn strip_invocation_args(event_data: &mut Value) -> bool {
    event_data
        .get_mut("res")
        .and_then(|res| res.get_mut("invocation"))
        .and_then(Value::as_object_mut)
        .and_then(|invocation| invocation.remove("module_args"))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verbosity_is_clamped() {
        assert_eq!(Verbosity::new(9).level(), 5);
        assert!(Verbosity::new(0).is_lowest());
        assert!(!Verbosity::new(1).is_lowest());
    }

    #[test]
    fn strips_nested_module_args() {
        let mut data = json!({
            "res": {"changed": true, "invocation": {"module_name": "shell", "module_args": "echo secret"}}
        });
        assert!(strip_invocation_args(&mut data));
        assert_eq!(data["res"]["invocation"], json!({"module_name": "shell"}));
        assert_eq!(data["res"]["changed"], true);
    }

    #[test]
    fn no_invocation_is_untouched() {
        let mut data = json!({"res": {"changed": false}});
        let before = data.clone();
        assert!(!strip_invocation_args(&mut data));
        assert_eq!(data, before);

        let mut scalar = json!("plain");
        assert!(!strip_invocation_args(&mut scalar));
    }
}
