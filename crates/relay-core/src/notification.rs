use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AdHocCommandId, JobId};

/// Endpoint of control packets addressed to the fan-out service itself.
pub const SESSIONS_ENDPOINT: &str = "sessions";
/// Control event that disconnects every session bound to `token_key`.
pub const INVALIDATE_EVENT: &str = "invalidate";

/// A packet published on the notification channel for live viewers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationPacket {
    pub event: String,
    #[serde(default)]
    pub args: Value,
    pub endpoint: String,
    /// Present only for directed delivery. Never forwarded to a client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_key: Option<String>,
}

/// What a browser client actually receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientPacket {
    pub event: String,
    pub args: Value,
    pub endpoint: String,
}

/// Where a packet should go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Broadcast,
    Direct(String),
    /// Not forwarded; the sessions bound to the token are closed.
    Invalidate(String),
}

impl NotificationPacket {
    pub fn broadcast(endpoint: impl Into<String>, event: impl Into<String>, args: Value) -> Self {
        Self {
            event: event.into(),
            args,
            endpoint: endpoint.into(),
            token_key: None,
        }
    }

    pub fn direct(
        endpoint: impl Into<String>,
        event: impl Into<String>,
        args: Value,
        token: impl Into<String>,
    ) -> Self {
        Self {
            token_key: Some(token.into()),
            ..Self::broadcast(endpoint, event, args)
        }
    }

    /// Ask the fan-out service to drop every session holding `token`.
    pub fn invalidate_sessions(token: impl Into<String>) -> Self {
        Self::direct(SESSIONS_ENDPOINT, INVALIDATE_EVENT, Value::Null, token)
    }

    /// Live update for a stored job event row.
    pub fn job_event(job_id: JobId, row: Value) -> Self {
        Self::broadcast("job_events", format!("job_events-{job_id}"), row)
    }

    /// Live update for a stored ad-hoc command event row.
    pub fn ad_hoc_event(id: AdHocCommandId, row: Value) -> Self {
        Self::broadcast("ad_hoc_command_events", format!("ad_hoc_command_events-{id}"), row)
    }

    /// Split into routing decision and the client-facing packet, stripping the token.
    pub fn into_delivery(self) -> (Delivery, ClientPacket) {
        let control = self.endpoint == SESSIONS_ENDPOINT && self.event == INVALIDATE_EVENT;
        let delivery = match self.token_key {
            Some(token) if control => Delivery::Invalidate(token),
            Some(token) => Delivery::Direct(token),
            None => Delivery::Broadcast,
        };
        let packet = ClientPacket {
            event: self.event,
            args: self.args,
            endpoint: self.endpoint,
        };
        (delivery, packet)
    }
}
