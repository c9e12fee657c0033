use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one live socket, scoped to a session code: `{code}:{suffix}`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn for_session(code: &str) -> Self {
        Self(format!("{}:{}", code, Uuid::now_v7().simple()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Session code part of the id, if the id is well-formed.
    pub fn session_code(&self) -> Option<&str> {
        self.0.rsplit_once(':').map(|(code, _)| code)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_is_scoped_to_session() {
        let id = ConnectionId::for_session("ABCD");
        assert!(id.as_str().starts_with("ABCD:"), "got: {id}");
        assert_eq!(id.session_code(), Some("ABCD"));
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::for_session("ABCD");
        let b = ConnectionId::for_session("ABCD");
        assert_ne!(a, b);
    }

    #[test]
    fn serde_transparent() {
        let id = ConnectionId::from_raw("ABCD:c1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ABCD:c1\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn malformed_id_has_no_code() {
        assert_eq!(ConnectionId::from_raw("nocolon").session_code(), None);
    }
}
