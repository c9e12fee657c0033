use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tutoria_telemetry::metrics::SANDBOX_LOG_FLUSHES_TOTAL;

/// Where sandbox output and worker loss are reported. Implementations handle
/// their own failures; the sandbox never retries.
#[async_trait]
pub trait SandboxSink: Send + Sync {
    /// Append one grouped entry holding `lines` in order.
    async fn append_logs(&self, code: &str, lines: Vec<String>);

    /// The worker for `code` died on its own and has been removed.
    async fn worker_lost(&self, code: &str);
}

struct Shared {
    code: String,
    lines: Mutex<Vec<String>>,
    sink: Arc<dyn SandboxSink>,
}

impl Shared {
    async fn flush(&self) {
        let batch = std::mem::take(&mut *self.lines.lock());
        if batch.is_empty() {
            return;
        }
        debug!(code = %self.code, lines = batch.len(), "flushing sandbox logs");
        counter!(SANDBOX_LOG_FLUSHES_TOTAL).increment(1);
        self.sink.append_logs(&self.code, batch).await;
    }
}

/// Collects log lines for one session and writes them as a single grouped
/// entry per tick.
pub struct LogBuffer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl LogBuffer {
    /// Create the buffer and start its flush tick.
    pub fn start(code: impl Into<String>, sink: Arc<dyn SandboxSink>, period: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            code: code.into(),
            lines: Mutex::new(Vec::new()),
            sink,
        });
        let cancel = CancellationToken::new();

        let tick_shared = Arc::clone(&shared);
        let tick_cancel = cancel.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = tick_cancel.cancelled() => break,
                    _ = interval.tick() => tick_shared.flush().await,
                }
            }
        });

        Arc::new(Self {
            shared,
            cancel,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    pub fn push(&self, line: impl Into<String>) {
        self.shared.lines.lock().push(line.into());
    }

    pub fn pending(&self) -> usize {
        self.shared.lines.lock().len()
    }

    /// Write whatever is buffered now.
    pub async fn flush(&self) {
        self.shared.flush().await;
    }

    /// Stop ticking and deliver the remainder. Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let ticker = self.ticker.lock().take();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        self.shared.flush().await;
    }
}

impl Drop for LogBuffer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
