//! Settings type definitions.
//!
//! Every section is `#[serde(default)]`, so a settings file only needs the keys
//! it wants to change. Field names are camelCase on the wire.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings shared by the `dispatch`, `facts` and `fanout` processes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub database: DatabaseSettings,
    pub endpoints: EndpointSettings,
    pub transport: TransportSettings,
    pub dispatch: DispatchSettings,
    pub fanout: FanoutSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would make a process unable to run.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.workers == 0 {
            return Err(SettingsError::InvalidValue("dispatch.workers must be at least 1".into()));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "dispatch.queueCapacity must be at least 1".into(),
            ));
        }
        if self.transport.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "transport.maxAttempts must be at least 1".into(),
            ));
        }
        if self.fanout.max_sessions == 0 {
            return Err(SettingsError::InvalidValue("fanout.maxSessions must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite database file shared by the dispatcher, workers and fan-out service.
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: relay_home().join("database").join("relay.db"),
        }
    }
}

/// One address per logical channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointSettings {
    pub callbacks: String,
    pub fact_cache: String,
    pub notifications: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            callbacks: "127.0.0.1:5556".to_string(),
            fact_cache: "127.0.0.1:6564".to_string(),
            notifications: "127.0.0.1:6557".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Send attempts per publish before the error is surfaced.
    pub max_attempts: u32,
    /// How long a publisher waits for the acknowledgment byte.
    pub ack_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ack_timeout_ms: 5_000,
        }
    }
}

impl TransportSettings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub pop_timeout_ms: u64,
    /// A worker exits after handling this many messages and is respawned.
    pub recycle_after: u64,
    pub shutdown_grace_ms: u64,
    /// Publish persisted events on the notification channel.
    pub emit_notifications: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 10_000,
            enqueue_timeout_ms: 100,
            health_interval_ms: 250,
            pop_timeout_ms: 1_000,
            recycle_after: 10_000,
            shutdown_grace_ms: 10_000,
            emit_notifications: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Bind address for the browser-facing websocket server.
    pub listen_addr: String,
    /// Registry capacity; the oldest session is evicted beyond this.
    pub max_sessions: usize,
    /// Per-connection outbound buffer.
    pub send_queue: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_sessions: 1_000,
            send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `~/.relay`, falling back to `/tmp/.relay` when `HOME` is unset.
pub fn relay_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = RelaySettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.dispatch.workers, 4);
        assert_eq!(settings.transport.max_attempts, 3);
        assert_eq!(settings.fanout.max_sessions, 1_000);
        assert!(settings.database.path.ends_with("database/relay.db"));
    }

    #[test]
    fn zero_workers_rejected() {
        let mut settings = RelaySettings::default();
        settings.dispatch.workers = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn camel_case_wire_format() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["dispatch"]["queueCapacity"].is_number());
        assert!(json["endpoints"]["factCache"].is_string());
    }
}
