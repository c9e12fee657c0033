use std::net::SocketAddr;

/// Messages from a worker to its orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Listener is up at `addr`. Sent at most once, before any failure.
    Opened { addr: SocketAddr },
    /// Worker could not start. Terminal.
    Failed { reason: String },
    /// Program standard output.
    Log(String),
    /// Program standard error and program faults.
    Error(String),
    /// Lifecycle notices.
    Info(String),
    /// Listener stopped without being asked to. Terminal.
    ListenerClosed { reason: String },
}

impl WorkerEvent {
    /// Text appended to the session log, for the events that carry one.
    pub fn log_line(&self) -> Option<String> {
        match self {
            Self::Log(line) | Self::Info(line) => Some(line.clone()),
            Self::Error(line) => Some(format!("error: {line}")),
            Self::Opened { .. } | Self::Failed { .. } | Self::ListenerClosed { .. } => None,
        }
    }
}
