use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use relay_core::fields::as_id;
use relay_core::Fields;
use relay_settings::RelaySettings;
use relay_store::facts::DEFAULT_FACT_MODULE;
use relay_store::{Database, FactRepo, FactRow};
use relay_transport::{Channel, Listener};

use crate::error::DispatchError;

/// A host fact update from a running job.
#[derive(Clone, Debug, PartialEq)]
pub struct FactMessage {
    pub inventory_id: i64,
    pub host: String,
    pub module: String,
    pub facts: serde_json::Value,
}

impl FactMessage {
    /// `None` when `host` or `inventory_id` is missing.
    pub fn parse(mut fields: Fields) -> Option<Self> {
        let host = fields.get("host")?.as_str()?.to_owned();
        let inventory_id = as_id(fields.get("inventory_id")?)?;
        let module = fields
            .get("module")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_FACT_MODULE)
            .to_owned();
        let facts = fields
            .remove("facts")
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        Some(Self {
            inventory_id,
            host,
            module,
            facts,
        })
    }
}

/// Upserts fact messages into the fact cache.
pub struct FactReceiver {
    facts: FactRepo,
}

impl FactReceiver {
    pub fn new(db: Database) -> Self {
        Self {
            facts: FactRepo::new(db),
        }
    }

    /// Store one raw message. Malformed messages and store faults yield `None`.
    pub fn handle(&self, fields: Fields) -> Option<FactRow> {
        let Some(message) = FactMessage::parse(fields) else {
            trace!("dropping fact message without host or inventory id");
            return None;
        };
        match self
            .facts
            .upsert(message.inventory_id, &message.host, &message.module, message.facts)
        {
            Ok(row) => {
                debug!(inventory_id = row.inventory_id, host = %row.host, module = %row.module, "facts cached");
                Some(row)
            }
            Err(e) => {
                error!(host = %message.host, error = %e, "failed to cache facts");
                None
            }
        }
    }

    pub async fn run(self, mut listener: Listener, cancel: CancellationToken) {
        info!(addr = %listener.local_addr(), "fact receiver running");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = listener.recv::<Fields>() => match message {
                    Some(fields) => {
                        self.handle(fields);
                    }
                    None => break,
                },
            }
        }
        listener.close();
    }
}

/// Bind the fact-cache channel and cache facts until `cancel` fires.
pub async fn run_fact_receiver(
    settings: &RelaySettings,
    db: Database,
    cancel: CancellationToken,
) -> Result<(), DispatchError> {
    let listener = Listener::bind(Channel::FactCache, Channel::FactCache.endpoint(&settings.endpoints)).await?;
    FactReceiver::new(db).run(listener, cancel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_transport::{Publisher, PublisherConfig};
    use serde_json::{json, Value};

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn parse_requires_host_and_inventory() {
        assert!(FactMessage::parse(fields(json!({"inventory_id": 1}))).is_none());
        assert!(FactMessage::parse(fields(json!({"host": "web1"}))).is_none());

        let msg = FactMessage::parse(fields(json!({"host": "web1", "inventory_id": "3"}))).unwrap();
        assert_eq!(msg.inventory_id, 3);
        assert_eq!(msg.module, DEFAULT_FACT_MODULE);
        assert_eq!(msg.facts, json!({}));
    }

    #[test]
    fn handle_upserts_per_module() {
        let db = Database::in_memory().unwrap();
        let receiver = FactReceiver::new(db.clone());

        receiver.handle(fields(json!({"host": "web1", "inventory_id": 1, "facts": {"mem": 1}})));
        receiver.handle(fields(json!({"host": "web1", "inventory_id": 1, "facts": {"mem": 2}})));
        receiver.handle(fields(json!({"host": "web1", "inventory_id": 1, "module": "services", "facts": {}})));

        let repo = FactRepo::new(db);
        assert_eq!(repo.count(1).unwrap(), 2);
        assert_eq!(repo.get(1, "web1", DEFAULT_FACT_MODULE).unwrap().unwrap().facts["mem"], 2);
    }

    #[tokio::test]
    async fn run_caches_published_facts() {
        let db = Database::in_memory().unwrap();
        let listener = Listener::bind(Channel::FactCache, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();
        let cancel = CancellationToken::new();
        let running = tokio::spawn(FactReceiver::new(db.clone()).run(listener, cancel.clone()));

        let mut publisher = Publisher::new(Channel::FactCache, addr, PublisherConfig::default());
        publisher
            .publish(&json!({"host": "db1", "inventory_id": 9, "facts": {"os": "linux"}}))
            .await
            .unwrap();
        // A second publish returns only once the first was handled.
        publisher.publish(&json!({"garbage": true})).await.unwrap();

        let row = FactRepo::new(db).get(9, "db1", DEFAULT_FACT_MODULE).unwrap().unwrap();
        assert_eq!(row.facts["os"], "linux");
        cancel.cancel();
        running.await.unwrap();
    }
}
