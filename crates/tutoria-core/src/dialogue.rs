use serde::{Deserialize, Serialize};

/// Author of a text entry in the dialogue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
    Log,
}

/// Editor block the tutor's answer points at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_name: Option<String>,
}

impl BlockReference {
    pub fn is_empty(&self) -> bool {
        self.block_id.is_none() && self.block_name.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EntryBody {
    Text {
        role: Role,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        block: Option<BlockReference>,
    },
    /// Sandbox output collected during one flush interval, in arrival order.
    GroupedLog { entries: Vec<String> },
}

/// One line of the session transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub id: u64,
    #[serde(flatten)]
    pub body: EntryBody,
}

impl DialogueEntry {
    pub fn text(id: u64, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            body: EntryBody::Text {
                role,
                content: content.into(),
                block: None,
            },
        }
    }

    pub fn answer(id: u64, content: impl Into<String>, block: BlockReference) -> Self {
        Self {
            id,
            body: EntryBody::Text {
                role: Role::Ai,
                content: content.into(),
                block: (!block.is_empty()).then_some(block),
            },
        }
    }

    pub fn grouped_log(id: u64, entries: Vec<String>) -> Self {
        Self {
            id,
            body: EntryBody::GroupedLog { entries },
        }
    }

    pub fn role(&self) -> Option<Role> {
        match &self.body {
            EntryBody::Text { role, .. } => Some(*role),
            EntryBody::GroupedLog { .. } => None,
        }
    }

    pub fn is_user_text(&self) -> bool {
        self.role() == Some(Role::User)
    }
}

/// Id for the entry appended after `entries`.
pub fn next_id(entries: &[DialogueEntry]) -> u64 {
    entries.last().map_or(1, |e| e.id + 1)
}

/// Entries of `submitted` that `stored` does not hold yet, in order.
///
/// Entries are matched by body; ids are assigned by the server and may differ
/// from a client's copy. A submission that lags behind `stored` brings nothing.
pub fn fresh_entries<'a>(stored: &[DialogueEntry], submitted: &'a [DialogueEntry]) -> Vec<&'a DialogueEntry> {
    let shared = stored
        .iter()
        .zip(submitted)
        .take_while(|(s, c)| s.body == c.body)
        .count();
    let unmatched = &stored[shared..];
    submitted[shared..]
        .iter()
        .filter(|entry| !unmatched.iter().any(|s| s.body == entry.body))
        .collect()
}

/// `stored` followed by the fresh entries of `submitted`, renumbered.
pub fn merge(stored: &[DialogueEntry], submitted: &[DialogueEntry]) -> Vec<DialogueEntry> {
    let mut merged = stored.to_vec();
    for entry in fresh_entries(stored, submitted) {
        let id = next_id(&merged);
        merged.push(DialogueEntry {
            id,
            body: entry.body.clone(),
        });
    }
    merged
}
