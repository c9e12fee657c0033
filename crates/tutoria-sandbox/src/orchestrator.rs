//! Sandbox orchestrator: one supervised worker per session code.
//!
//! `SandboxControl` is the interface the session server drives; the production
//! `SandboxOrchestrator` owns the worker map, the port pool and the route table.
//! Start and stop for the same code are serialized by a per-code lock; different
//! codes never contend.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tutoria_settings::SandboxSettings;
use tutoria_telemetry::metrics::{
    SANDBOX_STARTS_TOTAL, SANDBOX_START_FAILURES_TOTAL, SANDBOX_STOPS_TOTAL, SANDBOX_WORKERS_ACTIVE,
};

use crate::error::SandboxError;
use crate::events::WorkerEvent;
use crate::log_buffer::{LogBuffer, SandboxSink};
use crate::ports::PortAllocator;
use crate::routes::RouteTable;
use crate::worker::{self, WorkerConfig};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations the session server needs from the sandbox layer.
#[async_trait]
pub trait SandboxControl: Send + Sync {
    /// Run `source` for `code`, replacing any worker already running for it.
    async fn start(
        &self,
        code: &str,
        identity: &str,
        source: &str,
        route_prefix: &str,
    ) -> Result<SocketAddr, SandboxError>;

    /// Tear down the worker for `code`. `NotRunning` if there is none.
    async fn stop(&self, code: &str, identity: &str) -> Result<(), SandboxError>;

    fn is_running(&self, code: &str) -> bool;

    fn running_count(&self) -> usize;

    /// Stop every worker. Used on server shutdown.
    async fn shutdown(&self);
}

struct RunningWorker {
    generation: u64,
    identity: String,
    route_prefix: String,
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    pump: JoinHandle<()>,
    logs: Arc<LogBuffer>,
}

/// Production sandbox backed by child processes.
pub struct SandboxOrchestrator {
    config: Arc<WorkerConfig>,
    ports: Arc<PortAllocator>,
    routes: Arc<RouteTable>,
    sink: Arc<dyn SandboxSink>,
    flush_interval: Duration,
    start_timeout: Duration,
    workers: Arc<DashMap<String, RunningWorker>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,
}

impl SandboxOrchestrator {
    pub fn new(
        settings: &SandboxSettings,
        routes: Arc<RouteTable>,
        sink: Arc<dyn SandboxSink>,
    ) -> Result<Self, SandboxError> {
        let config = WorkerConfig::from_settings(settings)?;
        let ports = PortAllocator::new(
            config.bind_host,
            settings.port_range_start..=settings.port_range_end,
            settings.bind_attempts,
        );
        Ok(Self {
            config: Arc::new(config),
            ports,
            routes,
            sink,
            flush_interval: settings.log_flush_interval(),
            start_timeout: settings.start_timeout(),
            workers: Arc::new(DashMap::new()),
            locks: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn running_codes(&self) -> Vec<String> {
        self.workers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn address_of(&self, code: &str) -> Option<SocketAddr> {
        self.workers.get(code).map(|w| w.addr)
    }

    /// Serialize start/stop for `code`. The lock entry is dropped from the map
    /// once its last holder releases it.
    async fn lock_code(&self, code: &str) -> CodeGuard<'_> {
        let lock = self
            .locks
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        CodeGuard {
            locks: &self.locks,
            code: code.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Wait for the worker's first open/failed event, buffering any output.
    async fn await_open(
        &self,
        events: &mut mpsc::Receiver<WorkerEvent>,
        logs: &LogBuffer,
    ) -> Result<SocketAddr, SandboxError> {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(WorkerEvent::Opened { addr }) => return Ok(addr),
                    Some(WorkerEvent::Failed { reason }) => {
                        return Err(SandboxError::WorkerFailed(reason))
                    }
                    Some(WorkerEvent::ListenerClosed { reason }) => {
                        return Err(SandboxError::WorkerFailed(reason))
                    }
                    Some(other) => {
                        if let Some(line) = other.log_line() {
                            logs.push(line);
                        }
                    }
                    None => return Err(SandboxError::WorkerFailed("worker exited".into())),
                }
            }
        };
        tokio::time::timeout(self.start_timeout, wait)
            .await
            .map_err(|_| SandboxError::StartTimeout(self.start_timeout))?
    }

    async fn teardown(&self, code: &str, worker: RunningWorker) {
        self.routes.unregister(&worker.route_prefix, worker.addr);
        worker.cancel.cancel();
        finish(worker.task, code, "worker").await;
        finish(worker.pump, code, "event pump").await;
        worker.logs.stop().await;
        gauge!(SANDBOX_WORKERS_ACTIVE).decrement(1.0);
        counter!(SANDBOX_STOPS_TOTAL).increment(1);
        info!(code, addr = %worker.addr, "sandbox stopped");
    }
}

struct CodeGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    code: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CodeGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters hold a clone of the mutex, so only an idle entry is removed
        self.locks
            .remove_if(&self.code, |_, lock| Arc::strong_count(lock) == 1);
    }
}

async fn finish(mut handle: JoinHandle<()>, code: &str, what: &str) {
    if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
        warn!(code, what, "did not stop in time, aborting");
        handle.abort();
    }
}

/// Forward worker output to the log buffer until the worker ends. If the
/// listener dies on its own, remove the worker and report it lost.
async fn pump_events(
    code: String,
    generation: u64,
    mut events: mpsc::Receiver<WorkerEvent>,
    logs: Arc<LogBuffer>,
    workers: Arc<DashMap<String, RunningWorker>>,
    routes: Arc<RouteTable>,
    sink: Arc<dyn SandboxSink>,
) {
    while let Some(event) = events.recv().await {
        if let WorkerEvent::ListenerClosed { reason } = &event {
            logs.push(format!("error: {reason}"));
            let removed = workers.remove_if(&code, |_, w| w.generation == generation);
            if let Some((_, worker)) = removed {
                routes.unregister(&worker.route_prefix, worker.addr);
                logs.stop().await;
                gauge!(SANDBOX_WORKERS_ACTIVE).decrement(1.0);
                warn!(code = %code, %reason, "sandbox worker lost");
                sink.worker_lost(&code).await;
            }
            return;
        }
        if let Some(line) = event.log_line() {
            logs.push(line);
        }
    }
}

#[async_trait]
impl SandboxControl for SandboxOrchestrator {
    #[instrument(skip(self, identity, source), fields(bytes = source.len()))]
    async fn start(
        &self,
        code: &str,
        identity: &str,
        source: &str,
        route_prefix: &str,
    ) -> Result<SocketAddr, SandboxError> {
        if source.trim().is_empty() {
            return Err(SandboxError::EmptyProgram);
        }

        let _guard = self.lock_code(code).await;

        if let Some((_, previous)) = self.workers.remove(code) {
            debug!(code, "replacing running sandbox");
            self.teardown(code, previous).await;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let (task, mut events) = worker::launch(
            Arc::clone(&self.config),
            Arc::clone(&self.ports),
            code.to_string(),
            source.to_string(),
            cancel.clone(),
        );
        let logs = LogBuffer::start(code, Arc::clone(&self.sink), self.flush_interval);

        let addr = match self.await_open(&mut events, &logs).await {
            Ok(addr) => addr,
            Err(e) => {
                cancel.cancel();
                finish(task, code, "worker").await;
                while let Ok(event) = events.try_recv() {
                    if let Some(line) = event.log_line() {
                        logs.push(line);
                    }
                }
                logs.stop().await;
                counter!(SANDBOX_START_FAILURES_TOTAL, "reason" => e.kind()).increment(1);
                warn!(code, error = %e, "sandbox failed to start");
                return Err(e);
            }
        };

        self.routes.register(route_prefix, addr);
        let pump = tokio::spawn(pump_events(
            code.to_string(),
            generation,
            events,
            Arc::clone(&logs),
            Arc::clone(&self.workers),
            Arc::clone(&self.routes),
            Arc::clone(&self.sink),
        ));
        self.workers.insert(
            code.to_string(),
            RunningWorker {
                generation,
                identity: identity.to_string(),
                route_prefix: route_prefix.to_string(),
                addr,
                cancel,
                task,
                pump,
                logs,
            },
        );
        gauge!(SANDBOX_WORKERS_ACTIVE).increment(1.0);
        counter!(SANDBOX_STARTS_TOTAL).increment(1);
        info!(code, %addr, route_prefix, "sandbox started");
        Ok(addr)
    }

    #[instrument(skip(self, identity))]
    async fn stop(&self, code: &str, identity: &str) -> Result<(), SandboxError> {
        let _guard = self.lock_code(code).await;

        let owner = self.workers.get(code).map(|w| w.identity.clone());
        match owner {
            None => return Err(SandboxError::NotRunning(code.to_string())),
            Some(owner) if owner != identity => {
                return Err(SandboxError::IdentityMismatch(code.to_string()))
            }
            Some(_) => {}
        }

        let Some((_, worker)) = self.workers.remove(code) else {
            return Err(SandboxError::NotRunning(code.to_string()));
        };
        self.teardown(code, worker).await;
        Ok(())
    }

    fn is_running(&self, code: &str) -> bool {
        self.workers.contains_key(code)
    }

    fn running_count(&self) -> usize {
        self.workers.len()
    }

    async fn shutdown(&self) {
        let codes = self.running_codes();
        info!(count = codes.len(), "stopping all sandboxes");
        for code in codes {
            let _guard = self.lock_code(&code).await;
            if let Some((_, worker)) = self.workers.remove(&code) {
                self.teardown(&code, worker).await;
            }
        }
    }
}
