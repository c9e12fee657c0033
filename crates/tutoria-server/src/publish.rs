use std::sync::Arc;

use tutoria_core::{ServerMessage, SessionRecord};
use tutoria_store::SessionStore;

use crate::error::{Result, SessionError};
use crate::registry::ConnectionRegistry;

/// Persists session records and fans them out to the session's live sockets.
pub struct Publisher {
    store: Arc<dyn SessionStore>,
    registry: Arc<ConnectionRegistry>,
}

impl Publisher {
    pub fn new(store: Arc<dyn SessionStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn load(&self, code: &str) -> Result<Option<SessionRecord>> {
        Ok(self.store.get(code).await?)
    }

    pub async fn load_existing(&self, code: &str) -> Result<SessionRecord> {
        self.load(code)
            .await?
            .ok_or_else(|| SessionError::NotFound(code.to_string()))
    }

    pub async fn persist(&self, record: &SessionRecord) -> Result<()> {
        self.store.set(&record.code, record).await?;
        Ok(())
    }

    /// Persist, then send the full record to every connected client.
    pub async fn publish(&self, record: &SessionRecord) -> Result<()> {
        self.persist(record).await?;
        let text = ServerMessage::session(record.clone()).to_text();
        let delivered = self.registry.broadcast(&record.connected_clients, &text);
        tracing::debug!(code = %record.code, delivered, "session published");
        Ok(())
    }

    /// Send `{isRunning}` for the record's current sandbox state.
    pub fn announce_status(&self, record: &SessionRecord) {
        let text = ServerMessage::status(record.is_vm_running).to_text();
        self.registry.broadcast(&record.connected_clients, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbound;
    use tutoria_core::ConnectionId;
    use tutoria_store::MemorySessionStore;

    #[tokio::test]
    async fn publish_writes_then_broadcasts() {
        let store = Arc::new(MemorySessionStore::new());
        let registry = Arc::new(ConnectionRegistry::new(8));
        let id = ConnectionId::from_raw("ABCD:1");
        let mut rx = registry.register(id.clone());
        let publisher = Publisher::new(store.clone(), registry);

        let record = SessionRecord::new("ABCD", "u1", "en").with_client(id);
        publisher.publish(&record).await.unwrap();

        assert_eq!(store.snapshot("ABCD"), Some(record.clone()));
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["code"], "ABCD");
            }
            other => panic!("unexpected frame {other:?}"),
        }

        publisher.announce_status(&record.with_vm_running(true));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Text(r#"{"isRunning":true}"#.into())
        );
    }

    #[tokio::test]
    async fn load_existing_reports_missing() {
        let publisher = Publisher::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(ConnectionRegistry::new(8)),
        );
        assert!(matches!(
            publisher.load_existing("NOPE").await,
            Err(SessionError::NotFound(_))
        ));
    }
}
