use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use tutoria_sandbox::SandboxSink;

use crate::error::Result;
use crate::i18n;
use crate::publish::Publisher;

/// Writes sandbox output into the session dialogue and reacts to lost workers.
pub struct StoreLogSink {
    publisher: Arc<Publisher>,
}

impl StoreLogSink {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    async fn append(&self, code: &str, lines: Vec<String>) -> Result<()> {
        let latest = self.publisher.load_existing(code).await?;
        self.publisher.publish(&latest.with_grouped_log(lines)).await
    }

    async fn mark_lost(&self, code: &str) -> Result<()> {
        let latest = self.publisher.load_existing(code).await?;
        let note = i18n::messages(&latest.language).sandbox_lost;
        let next = latest.with_log(note).with_vm_running(false);
        self.publisher.publish(&next).await?;
        self.publisher.announce_status(&next);
        Ok(())
    }
}

#[async_trait]
impl SandboxSink for StoreLogSink {
    async fn append_logs(&self, code: &str, lines: Vec<String>) {
        if let Err(e) = self.append(code, lines).await {
            warn!(code, error = %e, "dropping sandbox log batch");
        }
    }

    async fn worker_lost(&self, code: &str) {
        if let Err(e) = self.mark_lost(code).await {
            warn!(code, error = %e, "failed to record lost sandbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionRegistry, Outbound};
    use tutoria_core::{ConnectionId, EntryBody, SessionRecord};
    use tutoria_store::MemorySessionStore;

    fn sink() -> (StoreLogSink, Arc<MemorySessionStore>, tokio::sync::mpsc::Receiver<Outbound>) {
        let id = ConnectionId::from_raw("ABCD:1");
        let record = SessionRecord::new("ABCD", "u1", "ms")
            .with_client(id.clone())
            .with_vm_running(true);
        let store = Arc::new(MemorySessionStore::with_records([record]));
        let registry = Arc::new(ConnectionRegistry::new(16));
        let rx = registry.register(id);
        let publisher = Arc::new(Publisher::new(store.clone(), registry));
        (StoreLogSink::new(publisher), store, rx)
    }

    #[tokio::test]
    async fn batch_becomes_one_grouped_entry() {
        let (sink, store, mut rx) = sink();
        sink.append_logs("ABCD", vec!["one".into(), "two".into()]).await;

        let record = store.snapshot("ABCD").unwrap();
        assert_eq!(record.dialogue.len(), 1);
        assert_eq!(
            record.dialogue[0].body,
            EntryBody::GroupedLog {
                entries: vec!["one".into(), "two".into()]
            }
        );
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn lost_worker_clears_running_flag() {
        let (sink, store, mut rx) = sink();
        sink.worker_lost("ABCD").await;

        let record = store.snapshot("ABCD").unwrap();
        assert!(!record.is_vm_running);
        assert_eq!(record.dialogue.len(), 1);
        let _session = rx.try_recv().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Text(r#"{"isRunning":false}"#.into())
        );
    }

    #[tokio::test]
    async fn unknown_session_is_ignored() {
        let (sink, store, _rx) = sink();
        sink.append_logs("WXYZ", vec!["x".into()]).await;
        assert!(store.snapshot("WXYZ").is_none());
    }
}
