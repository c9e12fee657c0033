use std::time::Duration;

/// Why a connection attempt was refused. The display text is sent to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationReason {
    #[error("Invalid code")]
    InvalidCode,
    #[error("Invalid identity")]
    InvalidIdentity,
}

/// Failures from the tutor model adapter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TutorError {
    #[error("tutor request failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid tutor response: {0}")]
    InvalidResponse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl TutorError {
    pub fn from_status(status: u16, body: String) -> Self {
        Self::Http { status, body }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Network(_) | Self::Timeout(_) => true,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Failures from the code generator adapter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("code generation failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid generator response: {0}")]
    InvalidResponse(String),
}
