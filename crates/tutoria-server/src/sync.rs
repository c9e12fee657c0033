//! Merging learner submissions into the stored session and deciding when the
//! tutor should answer.
//!
//! A submission that ends in a new user message publishes an optimistic record
//! (`isReplying = true`) right away and answers in a background task. When the
//! answer lands, the task re-reads the latest record and appends to that, so
//! edits made while the tutor was thinking survive.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tutoria_core::{SessionRecord, Tutor, ValidationReason};
use tutoria_telemetry::metrics::{TUTOR_DURATION_SECONDS, TUTOR_FAILURES_TOTAL, TUTOR_INVOCATIONS_TOTAL};

use crate::error::Result;
use crate::i18n;
use crate::publish::Publisher;
use crate::tasks::ConnectionTasks;

/// What a submission led to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Same content as stored: nothing written, nothing sent.
    Unchanged,
    /// Stored and broadcast as submitted.
    Accepted,
    /// Optimistic record published, tutor invoked in the background.
    Replying,
}

pub struct DialogueSynchronizer {
    publisher: Arc<Publisher>,
    tutor: Arc<dyn Tutor>,
}

impl DialogueSynchronizer {
    pub fn new(publisher: Arc<Publisher>, tutor: Arc<dyn Tutor>) -> Self {
        Self { publisher, tutor }
    }

    /// Apply a submitted document for session `code`.
    pub async fn submit(
        &self,
        code: &str,
        submitted: SessionRecord,
        tasks: &ConnectionTasks,
    ) -> Result<SyncOutcome> {
        let stored = self.publisher.load_existing(code).await?;
        if submitted.owner_identity != stored.owner_identity {
            return Err(ValidationReason::InvalidIdentity.into());
        }
        if submitted.same_content(&stored) {
            debug!(code, "submission unchanged");
            return Ok(SyncOutcome::Unchanged);
        }

        if submitted.needs_tutor(&stored) {
            let pending = stored.optimistic_reply(&submitted);
            self.publisher.publish(&pending).await?;

            let publisher = Arc::clone(&self.publisher);
            let tutor = Arc::clone(&self.tutor);
            let code = code.to_string();
            tasks.spawn(move |cancel| answer(publisher, tutor, code, pending, cancel));
            return Ok(SyncOutcome::Replying);
        }

        let accepted = stored.accept_submission(&submitted);
        self.publisher.publish(&accepted).await?;
        Ok(SyncOutcome::Accepted)
    }
}

async fn answer(
    publisher: Arc<Publisher>,
    tutor: Arc<dyn Tutor>,
    code: String,
    snapshot: SessionRecord,
    cancel: CancellationToken,
) {
    counter!(TUTOR_INVOCATIONS_TOTAL).increment(1);
    let started = Instant::now();
    let result = tokio::select! {
        () = cancel.cancelled() => None,
        result = tutor.invoke(&snapshot) => Some(result),
    };
    histogram!(TUTOR_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    let latest = match publisher.load(&code).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(code = %code, "session vanished while the tutor was answering");
            return;
        }
        Err(e) => {
            warn!(code = %code, error = %e, "failed to reload session after tutor call");
            return;
        }
    };

    let next = match result {
        None => {
            debug!(code = %code, "tutor call abandoned");
            latest.with_reply_cleared()
        }
        Some(Ok(reply)) => {
            info!(code = %code, progress = ?reply.progress, "tutor answered");
            latest.with_tutor_answer(&reply)
        }
        Some(Err(e)) => {
            counter!(TUTOR_FAILURES_TOTAL).increment(1);
            warn!(code = %code, error = %e, "tutor call failed");
            latest.with_tutor_failure(i18n::messages(&latest.language).tutor_failed)
        }
    };
    if let Err(e) = publisher.publish(&next).await {
        warn!(code = %code, error = %e, "failed to store tutor result");
    }
}
