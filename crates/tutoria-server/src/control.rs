use std::sync::Arc;

use tracing::{info, warn};

use tutoria_core::{CodeGenerator, SessionRecord};
use tutoria_sandbox::{SandboxControl, SandboxError};

use crate::error::{Result, SessionError};
use crate::i18n;
use crate::publish::Publisher;

/// Handles `open` and `stop` requests: code generation, sandbox lifecycle,
/// and the `isVMRunning` flag.
pub struct SandboxController {
    publisher: Arc<Publisher>,
    sandbox: Arc<dyn SandboxControl>,
    codegen: Arc<dyn CodeGenerator>,
    route_prefix: String,
}

impl SandboxController {
    pub fn new(
        publisher: Arc<Publisher>,
        sandbox: Arc<dyn SandboxControl>,
        codegen: Arc<dyn CodeGenerator>,
        route_prefix: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            sandbox,
            codegen,
            route_prefix: route_prefix.into(),
        }
    }

    pub fn sandbox(&self) -> &Arc<dyn SandboxControl> {
        &self.sandbox
    }

    /// Proxy prefix under which the worker for `code` is reachable.
    pub fn route_for(&self, code: &str) -> String {
        format!("{}/{}", self.route_prefix, code)
    }

    /// Generate the program from the stored workspace and run it. Returns
    /// whether a sandbox is running afterwards. Failures the learner should see
    /// become dialogue notes, not errors.
    pub async fn open(&self, code: &str, identity: &str) -> Result<bool> {
        let stored = self.publisher.load_existing(code).await?;
        let messages = i18n::messages(&stored.language);

        let source = match self
            .codegen
            .generate(&stored.workspace_state, &stored.language)
            .await
        {
            Ok(source) => source,
            Err(e) => {
                warn!(code, error = %SessionError::Generation(e), "open failed");
                self.settle_stopped(code, Some(messages.generation_failed)).await?;
                return Ok(false);
            }
        };
        if source.trim().is_empty() {
            info!(code, "nothing to run");
            self.settle_stopped(code, Some(messages.empty_code)).await?;
            return Ok(false);
        }

        match self
            .sandbox
            .start(code, identity, &source, &self.route_for(code))
            .await
        {
            Ok(addr) => {
                info!(code, %addr, "sandbox opened");
                let latest = self.publisher.load_existing(code).await?;
                let next = latest.with_vm_running(true).record_execution();
                self.publish_state(&next).await?;
                Ok(true)
            }
            Err(SandboxError::EmptyProgram) => {
                self.settle_stopped(code, Some(messages.empty_code)).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(code, error = %SessionError::SandboxStart(e), "open failed");
                self.settle_stopped(code, Some(messages.sandbox_failed)).await?;
                Ok(false)
            }
        }
    }

    /// Stop the session's sandbox. Stopping an idle session still settles the flag.
    pub async fn stop(&self, code: &str, identity: &str) -> Result<()> {
        match self.sandbox.stop(code, identity).await {
            Ok(()) => info!(code, "sandbox stopped on request"),
            Err(SandboxError::NotRunning(_)) => {}
            Err(e) => return Err(SessionError::SandboxRuntime(e)),
        }
        self.settle_stopped(code, None).await
    }

    /// Stop after the last client left. The sandbox is stopped with the owner's
    /// identity; the caller persists the record.
    pub async fn stop_abandoned(&self, record: &SessionRecord) -> Result<()> {
        match self.sandbox.stop(&record.code, &record.owner_identity).await {
            Ok(()) => {
                info!(code = %record.code, "sandbox stopped, no clients left");
                Ok(())
            }
            Err(SandboxError::NotRunning(_)) => Ok(()),
            Err(e) => Err(SessionError::SandboxRuntime(e)),
        }
    }

    /// Re-read, optionally note something in the dialogue, clear the running
    /// flag, and publish record plus status.
    async fn settle_stopped(&self, code: &str, note: Option<&str>) -> Result<()> {
        let latest = self.publisher.load_existing(code).await?;
        let noted = match note {
            Some(message) => latest.with_log(message),
            None => latest,
        };
        self.publish_state(&noted.with_vm_running(false)).await
    }

    async fn publish_state(&self, record: &SessionRecord) -> Result<()> {
        self.publisher.publish(record).await?;
        self.publisher.announce_status(record);
        Ok(())
    }
}
