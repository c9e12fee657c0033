//! The persisted state of one tutoring session.
//!
//! Every mutation goes through a named operation that returns a complete new
//! record, so no field is ever dropped by a partial update. Each operation
//! touches `updated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::TutorAnswer;
use crate::dialogue::{self, DialogueEntry, Role};
use crate::ids::ConnectionId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tutorial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    pub progress: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStats {
    pub total_connected_ms: u64,
    pub total_invocations: u64,
    pub total_code_executions: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub code: String,
    pub owner_identity: String,
    #[serde(default)]
    pub workspace_state: serde_json::Value,
    #[serde(default)]
    pub dialogue: Vec<DialogueEntry>,
    #[serde(default)]
    pub is_replying: bool,
    #[serde(default)]
    pub tutorial: Tutorial,
    #[serde(default)]
    pub stats: SessionStats,
    #[serde(rename = "isVMRunning", default)]
    pub is_vm_running: bool,
    #[serde(default)]
    pub connected_clients: Vec<ConnectionId>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_language() -> String {
    "en".to_string()
}

impl SessionRecord {
    /// Fresh record for a newly issued session code.
    pub fn new(code: impl Into<String>, owner_identity: impl Into<String>, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            code: code.into(),
            owner_identity: owner_identity.into(),
            workspace_state: serde_json::Value::Null,
            dialogue: Vec::new(),
            is_replying: false,
            tutorial: Tutorial::default(),
            stats: SessionStats::default(),
            is_vm_running: false,
            connected_clients: Vec::new(),
            language: language.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// True when this submission changes none of the learner-editable content
    /// of `stored`: same workspace, tutorial and language, and no dialogue
    /// entries that `stored` lacks.
    pub fn same_content(&self, stored: &SessionRecord) -> bool {
        self.workspace_state == stored.workspace_state
            && self.tutorial == stored.tutorial
            && self.language == stored.language
            && dialogue::fresh_entries(&stored.dialogue, &self.dialogue).is_empty()
    }

    /// Whether a submission should be answered by the tutor, given what is stored.
    ///
    /// The last entry the submission adds must be a user text entry. Entries
    /// already stored, answered or pending, never count.
    pub fn needs_tutor(&self, stored: &SessionRecord) -> bool {
        dialogue::fresh_entries(&stored.dialogue, &self.dialogue)
            .last()
            .is_some_and(|entry| entry.is_user_text())
    }

    pub fn has_client(&self, id: &ConnectionId) -> bool {
        self.connected_clients.contains(id)
    }

    pub fn with_client(&self, id: ConnectionId) -> Self {
        let mut next = self.clone();
        if !next.connected_clients.contains(&id) {
            next.connected_clients.push(id);
        }
        next.touch()
    }

    pub fn without_client(&self, id: &ConnectionId) -> Self {
        let mut next = self.clone();
        next.connected_clients.retain(|c| c != id);
        next.touch()
    }

    pub fn retain_clients(&self, keep: impl Fn(&ConnectionId) -> bool) -> Self {
        let mut next = self.clone();
        next.connected_clients.retain(|c| keep(c));
        next.touch()
    }

    /// Take the learner-editable content from `submitted`; everything the
    /// server owns stays as stored. The stored dialogue is kept and only the
    /// entries it lacks are appended.
    pub fn accept_submission(&self, submitted: &SessionRecord) -> Self {
        let mut next = self.clone();
        next.workspace_state = submitted.workspace_state.clone();
        next.dialogue = dialogue::merge(&self.dialogue, &submitted.dialogue);
        next.tutorial.content_ref = submitted.tutorial.content_ref.clone();
        next.tutorial.progress = submitted.tutorial.progress;
        next.language = submitted.language.clone();
        next.touch()
    }

    /// Intermediate state published while the tutor is thinking: the submitted
    /// content is echoed, tutorial progress stays as stored.
    pub fn optimistic_reply(&self, submitted: &SessionRecord) -> Self {
        let progress = self.tutorial.progress;
        let mut next = self.accept_submission(submitted);
        next.tutorial.progress = progress;
        next.is_replying = true;
        next
    }

    /// Merge a tutor answer into the latest stored record.
    pub fn with_tutor_answer(&self, answer: &TutorAnswer) -> Self {
        let mut next = self.clone();
        let id = dialogue::next_id(&next.dialogue);
        next.dialogue
            .push(DialogueEntry::answer(id, answer.response.clone(), answer.block()));
        next.is_replying = false;
        if let Some(progress) = answer.progress {
            next.tutorial.progress = progress;
        }
        next.stats.total_invocations += 1;
        next.touch()
    }

    /// Clear the pending flag after a failed invocation, leaving a note in the dialogue.
    pub fn with_tutor_failure(&self, message: &str) -> Self {
        let mut next = self.with_log(message);
        next.is_replying = false;
        next
    }

    /// Drop a pending reply without answering it.
    pub fn with_reply_cleared(&self) -> Self {
        let mut next = self.clone();
        next.is_replying = false;
        next.touch()
    }

    pub fn with_log(&self, message: &str) -> Self {
        let mut next = self.clone();
        let id = dialogue::next_id(&next.dialogue);
        next.dialogue.push(DialogueEntry::text(id, Role::Log, message));
        next.touch()
    }

    pub fn with_grouped_log(&self, entries: Vec<String>) -> Self {
        let mut next = self.clone();
        let id = dialogue::next_id(&next.dialogue);
        next.dialogue.push(DialogueEntry::grouped_log(id, entries));
        next.touch()
    }

    pub fn with_vm_running(&self, running: bool) -> Self {
        let mut next = self.clone();
        next.is_vm_running = running;
        next.touch()
    }

    pub fn add_connected_time(&self, ms: u64) -> Self {
        let mut next = self.clone();
        next.stats.total_connected_ms += ms;
        next.touch()
    }

    pub fn record_execution(&self) -> Self {
        let mut next = self.clone();
        next.stats.total_code_executions += 1;
        next.touch()
    }

    fn touch(mut self) -> Self {
        self.updated_at = Utc::now();
        self
    }
}
