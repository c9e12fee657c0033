use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use tutoria_core::{CodeGenerator, GenerationError, SessionRecord, Tutor, TutorAnswer, TutorError};

/// Pre-programmed tutor outcomes for deterministic tests.
pub enum MockAnswer {
    Answer(TutorAnswer),
    Error(TutorError),
    /// Wait a duration, then produce the inner outcome.
    Delay(Duration, Box<MockAnswer>),
    /// Wait until the notify fires, then produce the inner outcome.
    Gated(Arc<Notify>, Box<MockAnswer>),
}

impl MockAnswer {
    pub fn text(response: &str) -> Self {
        Self::Answer(TutorAnswer::text(response))
    }

    pub fn delayed(delay: Duration, inner: MockAnswer) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn gated(gate: Arc<Notify>, inner: MockAnswer) -> Self {
        Self::Gated(gate, Box::new(inner))
    }
}

/// Tutor that replays queued outcomes in order and records what it was asked.
pub struct MockTutor {
    answers: Mutex<VecDeque<MockAnswer>>,
    snapshots: Mutex<Vec<SessionRecord>>,
    call_count: AtomicUsize,
}

impl MockTutor {
    pub fn new(answers: Vec<MockAnswer>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            snapshots: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn snapshots(&self) -> Vec<SessionRecord> {
        self.snapshots.lock().clone()
    }
}

#[async_trait]
impl Tutor for MockTutor {
    async fn invoke(&self, snapshot: &SessionRecord) -> Result<TutorAnswer, TutorError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.snapshots.lock().push(snapshot.clone());
        let next = self.answers.lock().pop_front();
        let mut outcome = next.ok_or_else(|| {
            TutorError::InvalidResponse("no more mock answers".into())
        })?;
        loop {
            outcome = match outcome {
                MockAnswer::Answer(answer) => return Ok(answer),
                MockAnswer::Error(e) => return Err(e),
                MockAnswer::Delay(d, inner) => {
                    tokio::time::sleep(d).await;
                    *inner
                }
                MockAnswer::Gated(gate, inner) => {
                    gate.notified().await;
                    *inner
                }
            };
        }
    }
}

/// Code generator returning a fixed result.
pub struct MockCodeGenerator {
    result: Result<String, GenerationError>,
    call_count: AtomicUsize,
}

impl MockCodeGenerator {
    pub fn returning(source: &str) -> Self {
        Self {
            result: Ok(source.to_string()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: GenerationError) -> Self {
        Self {
            result: Err(error),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CodeGenerator for MockCodeGenerator {
    async fn generate(
        &self,
        _workspace: &serde_json::Value,
        _language: &str,
    ) -> Result<String, GenerationError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.result.clone()
    }
}
