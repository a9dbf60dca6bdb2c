use tracing::warn;

use relay_core::{EventOwner, NotificationPacket};
use relay_store::EventRow;
use relay_transport::{Channel, Publisher, PublisherConfig};

/// Where live notifications are published.
#[derive(Clone, Debug)]
pub struct NotifyTarget {
    pub addr: String,
    pub config: PublisherConfig,
}

/// Publishes stored rows for live viewers. Each owner of a `Notifier` has its own socket.
pub struct Notifier {
    publisher: Option<Publisher>,
}

impl Notifier {
    pub fn new(target: Option<&NotifyTarget>) -> Self {
        Self {
            publisher: target
                .map(|t| Publisher::new(Channel::Notifications, t.addr.clone(), t.config.clone())),
        }
    }

    pub fn disabled() -> Self {
        Self { publisher: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.publisher.is_some()
    }

    /// Publish a stored row. Failures are logged and swallowed.
    pub async fn notify(&mut self, row: &EventRow) {
        let Some(publisher) = self.publisher.as_mut() else {
            return;
        };
        let Some(packet) = packet_for(row) else {
            return;
        };
        if let Err(e) = publisher.publish(&packet).await {
            warn!(event_id = %row.id, error = %e, "failed to publish event notification");
        }
    }
}

/// Notification packet announcing a stored row on its run's live channel.
pub fn packet_for(row: &EventRow) -> Option<NotificationPacket> {
    let args = serde_json::to_value(row).ok()?;
    Some(match row.owner()? {
        EventOwner::Job(id) => NotificationPacket::job_event(id, args),
        EventOwner::AdHoc(id) => NotificationPacket::ad_hoc_event(id, args),
    })
}
