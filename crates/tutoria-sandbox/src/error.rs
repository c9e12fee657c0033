#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("program source is empty")]
    EmptyProgram,

    #[error("no sandbox running for {0}")]
    NotRunning(String),

    #[error("identity does not own sandbox {0}")]
    IdentityMismatch(String),

    #[error("no free port after {attempts} attempts")]
    NoFreePort { attempts: u32 },

    #[error("worker failed to start: {0}")]
    WorkerFailed(String),

    #[error("worker did not report within {0:?}")]
    StartTimeout(std::time::Duration),

    #[error("invalid sandbox configuration: {0}")]
    Config(String),
}

impl SandboxError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyProgram => "empty_program",
            Self::NotRunning(_) => "not_running",
            Self::IdentityMismatch(_) => "identity_mismatch",
            Self::NoFreePort { .. } => "no_free_port",
            Self::WorkerFailed(_) => "worker_failed",
            Self::StartTimeout(_) => "start_timeout",
            Self::Config(_) => "config",
        }
    }
}
