//! JSON messages exchanged over a session socket.

use serde::{Deserialize, Serialize};

use crate::record::SessionRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlRequest {
    Ping,
    Pong,
    Open,
    Stop,
}

/// Inbound message: a control request or a full session document.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Control { request: ControlRequest },
    Document(Box<SessionRecord>),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Outbound message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status {
        #[serde(rename = "isRunning")]
        is_running: bool,
    },
    Control { request: ControlRequest },
    Error { error: String },
    Session(Box<SessionRecord>),
}

impl ServerMessage {
    pub const GENERIC_ERROR: &'static str = "Server error";

    pub fn status(is_running: bool) -> Self {
        Self::Status { is_running }
    }

    pub fn ping() -> Self {
        Self::Control {
            request: ControlRequest::Ping,
        }
    }

    pub fn pong() -> Self {
        Self::Control {
            request: ControlRequest::Pong,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            error: reason.into(),
        }
    }

    pub fn generic_error() -> Self {
        Self::error(Self::GENERIC_ERROR)
    }

    pub fn session(record: SessionRecord) -> Self {
        Self::Session(Box::new(record))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\":\"{}\"}}", Self::GENERIC_ERROR))
    }
}
