//! Session-level operations behind each socket: admission, dispatch of inbound
//! messages, and the bookkeeping when a socket goes away.

use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use tutoria_core::{ConnectionId, ServerMessage, SessionRecord, ValidationReason};
use tutoria_settings::KeepaliveSettings;
use tutoria_telemetry::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};

use crate::control::SandboxController;
use crate::error::{Result, SessionError};
use crate::publish::Publisher;
use crate::registry::{ConnectionRegistry, Outbound};
use crate::sync::DialogueSynchronizer;
use crate::tasks::ConnectionTasks;

/// Work a socket hands to its dispatcher, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    Document(Box<SessionRecord>),
    Open,
    Stop,
    /// A ping was answered; credit the interval to the session.
    Pong,
}

/// A socket that passed validation.
pub struct Admission {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
    pub record: SessionRecord,
}

pub struct Gateway {
    publisher: Arc<Publisher>,
    sync: DialogueSynchronizer,
    control: Arc<SandboxController>,
    keepalive: KeepaliveSettings,
}

impl Gateway {
    pub fn new(
        publisher: Arc<Publisher>,
        sync: DialogueSynchronizer,
        control: Arc<SandboxController>,
        keepalive: KeepaliveSettings,
    ) -> Self {
        Self {
            publisher,
            sync,
            control,
            keepalive,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.publisher.registry()
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn control(&self) -> &Arc<SandboxController> {
        &self.control
    }

    pub fn keepalive(&self) -> &KeepaliveSettings {
        &self.keepalive
    }

    /// Validate a connection attempt and register its socket. Ids in the record
    /// without a live socket here are pruned. The new socket's queue already
    /// holds the current `{isRunning}`.
    #[instrument(skip(self, identity))]
    pub async fn admit(&self, code: &str, identity: &str) -> Result<Admission> {
        let stored = self
            .publisher
            .load(code)
            .await?
            .ok_or(ValidationReason::InvalidCode)?;
        if stored.owner_identity != identity {
            return Err(ValidationReason::InvalidIdentity.into());
        }

        let registry = self.registry();
        let id = ConnectionId::for_session(code);
        let outbound = registry.register(id.clone());
        let record = stored
            .retain_clients(|c| registry.is_live(c))
            .with_client(id.clone());
        if let Err(e) = self.publisher.persist(&record).await {
            registry.unregister(&id);
            return Err(e);
        }
        registry.send_to(&id, Outbound::Text(ServerMessage::status(record.is_vm_running).to_text()));

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        info!(connection = %id, clients = record.connected_clients.len(), "client connected");
        Ok(Admission { id, outbound, record })
    }

    /// Handle one inbound message for session `code`.
    pub async fn dispatch(
        &self,
        code: &str,
        identity: &str,
        message: Inbound,
        tasks: &ConnectionTasks,
    ) -> Result<()> {
        match message {
            Inbound::Document(submitted) => {
                let outcome = self.sync.submit(code, *submitted, tasks).await?;
                tracing::debug!(code, ?outcome, "document handled");
            }
            Inbound::Open => {
                self.control.open(code, identity).await?;
            }
            Inbound::Stop => self.control.stop(code, identity).await?,
            Inbound::Pong => {
                let latest = self.publisher.load_existing(code).await?;
                let credited = latest.add_connected_time(self.keepalive.ping_interval_ms);
                self.publisher.persist(&credited).await?;
            }
        }
        Ok(())
    }

    /// Record that socket `id` is gone. The caller has already unregistered it.
    /// If the sandbox is running and no client is left, it is stopped. Returns
    /// whether this call stopped it.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, code: &str, id: &ConnectionId) -> Result<bool> {
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        let Some(stored) = self.publisher.load(code).await? else {
            return Ok(false);
        };
        let registry = self.registry();
        let mut next = stored
            .without_client(id)
            .retain_clients(|c| registry.is_live(c));

        let mut stopped = false;
        if next.is_vm_running && next.connected_clients.is_empty() {
            if let Err(e) = self.control.stop_abandoned(&next).await {
                warn!(code, error = %e, "failed to stop abandoned sandbox");
            }
            next = next.with_vm_running(false);
            stopped = true;
        }
        self.publisher.persist(&next).await?;
        info!(connection = %id, remaining = next.connected_clients.len(), stopped, "client disconnected");
        Ok(stopped)
    }

    /// Tell one socket about a failed dispatch. Returns true when the
    /// connection must close.
    pub fn report(&self, id: &ConnectionId, err: &SessionError) -> bool {
        let registry = self.registry();
        registry.send_to(id, Outbound::Text(err.client_message().to_text()));
        match err.close_reason() {
            Some(reason) => {
                registry.send_to(id, Outbound::Close(reason.to_string()));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::control::tests::FakeSandbox;
    use std::sync::atomic::Ordering;
    use tutoria_llm::{MockCodeGenerator, MockTutor};
    use tutoria_sandbox::SandboxControl;
    use tutoria_store::MemorySessionStore;

    pub(crate) struct Harness {
        pub store: Arc<MemorySessionStore>,
        pub sandbox: Arc<FakeSandbox>,
        pub gateway: Gateway,
    }

    pub(crate) fn harness(records: Vec<SessionRecord>) -> Harness {
        let store = Arc::new(MemorySessionStore::with_records(records));
        let registry = Arc::new(ConnectionRegistry::new(64));
        let publisher = Arc::new(Publisher::new(store.clone(), registry));
        let sandbox = Arc::new(FakeSandbox::default());
        let control = Arc::new(SandboxController::new(
            publisher.clone(),
            sandbox.clone(),
            Arc::new(MockCodeGenerator::returning("sleep 30")),
            "/sandbox",
        ));
        let sync = DialogueSynchronizer::new(publisher.clone(), Arc::new(MockTutor::new(vec![])));
        Harness {
            store,
            sandbox,
            gateway: Gateway::new(publisher, sync, control, KeepaliveSettings::default()),
        }
    }

    fn session() -> SessionRecord {
        SessionRecord::new("ABCD", "u1", "en")
    }

    #[tokio::test]
    async fn unknown_code_is_rejected() {
        let h = harness(vec![]);
        let err = h.gateway.admit("NOPE", "u1").await.err().unwrap();
        assert_eq!(err.close_reason(), Some(ValidationReason::InvalidCode));
        assert_eq!(h.gateway.registry().count(), 0);
    }

    #[tokio::test]
    async fn wrong_identity_is_rejected() {
        let h = harness(vec![session()]);
        let err = h.gateway.admit("ABCD", "someone").await.err().unwrap();
        assert_eq!(err.close_reason(), Some(ValidationReason::InvalidIdentity));
    }

    #[tokio::test]
    async fn admission_prunes_stale_ids_and_reports_status() {
        let stale = session()
            .with_client(ConnectionId::from_raw("ABCD:stale"))
            .with_vm_running(true);
        let h = harness(vec![stale]);
        let mut admission = h.gateway.admit("ABCD", "u1").await.unwrap();

        assert_eq!(admission.record.connected_clients, vec![admission.id.clone()]);
        assert_eq!(
            h.store.snapshot("ABCD").unwrap().connected_clients,
            vec![admission.id.clone()]
        );
        assert!(admission.id.as_str().starts_with("ABCD:"));
        assert_eq!(
            admission.outbound.try_recv().unwrap(),
            Outbound::Text(r#"{"isRunning":true}"#.into())
        );
    }

    #[tokio::test]
    async fn last_disconnect_stops_running_sandbox_once() {
        let h = harness(vec![session()]);
        let a = h.gateway.admit("ABCD", "u1").await.unwrap();
        let b = h.gateway.admit("ABCD", "u1").await.unwrap();
        let tasks = ConnectionTasks::new();
        h.gateway.dispatch("ABCD", "u1", Inbound::Open, &tasks).await.unwrap();
        assert!(h.store.snapshot("ABCD").unwrap().is_vm_running);

        h.gateway.registry().unregister(&a.id);
        assert!(!h.gateway.disconnect("ABCD", &a.id).await.unwrap());
        assert!(h.sandbox.is_running("ABCD"));
        assert_eq!(h.sandbox.stops.load(Ordering::SeqCst), 0);

        h.gateway.registry().unregister(&b.id);
        assert!(h.gateway.disconnect("ABCD", &b.id).await.unwrap());
        assert!(!h.sandbox.is_running("ABCD"));
        assert_eq!(h.sandbox.stops.load(Ordering::SeqCst), 1);

        let record = h.store.snapshot("ABCD").unwrap();
        assert!(!record.is_vm_running);
        assert!(record.connected_clients.is_empty());
    }

    #[tokio::test]
    async fn simultaneous_last_disconnects_stop_once() {
        let h = harness(vec![session()]);
        let a = h.gateway.admit("ABCD", "u1").await.unwrap();
        let b = h.gateway.admit("ABCD", "u1").await.unwrap();
        h.gateway
            .dispatch("ABCD", "u1", Inbound::Open, &ConnectionTasks::new())
            .await
            .unwrap();

        h.gateway.registry().unregister(&a.id);
        h.gateway.registry().unregister(&b.id);
        h.gateway.disconnect("ABCD", &a.id).await.unwrap();
        h.gateway.disconnect("ABCD", &b.id).await.unwrap();
        assert_eq!(h.sandbox.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pong_credits_connected_time() {
        let h = harness(vec![session()]);
        let tasks = ConnectionTasks::new();
        h.gateway.dispatch("ABCD", "u1", Inbound::Pong, &tasks).await.unwrap();
        h.gateway.dispatch("ABCD", "u1", Inbound::Pong, &tasks).await.unwrap();
        assert_eq!(h.store.snapshot("ABCD").unwrap().stats.total_connected_ms, 10_000);
    }

    #[tokio::test]
    async fn validation_failure_queues_error_then_close() {
        let h = harness(vec![session()]);
        let mut admission = h.gateway.admit("ABCD", "u1").await.unwrap();
        let _status = admission.outbound.try_recv().unwrap();

        let closes = h
            .gateway
            .report(&admission.id, &SessionError::from(ValidationReason::InvalidIdentity));
        assert!(closes);
        assert_eq!(
            admission.outbound.try_recv().unwrap(),
            Outbound::Text(r#"{"error":"Invalid identity"}"#.into())
        );
        assert_eq!(
            admission.outbound.try_recv().unwrap(),
            Outbound::Close("Invalid identity".into())
        );
    }
}
