use tutoria_core::{GenerationError, ServerMessage, TutorError, ValidationReason};
use tutoria_sandbox::SandboxError;
use tutoria_store::StoreError;

/// Failures while handling a session connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(#[from] ValidationReason),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("code generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("sandbox failed to start: {0}")]
    SandboxStart(SandboxError),

    #[error("sandbox error: {0}")]
    SandboxRuntime(SandboxError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("tutor error: {0}")]
    Tutor(#[from] TutorError),
}

impl SessionError {
    /// Reason sent in the close frame when this error ends the connection.
    pub fn close_reason(&self) -> Option<ValidationReason> {
        match self {
            Self::Validation(reason) => Some(*reason),
            Self::NotFound(_) => Some(ValidationReason::InvalidCode),
            _ => None,
        }
    }

    /// What the client is told. Internal detail never leaves the server.
    pub fn client_message(&self) -> ServerMessage {
        match self.close_reason() {
            Some(reason) => ServerMessage::error(reason.to_string()),
            None => ServerMessage::generic_error(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
