use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use tutoria_core::SessionRecord;

use crate::error::StoreError;
use crate::store::SessionStore;

/// Process-local store for `--in-memory` runs and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<BTreeMap<String, SessionRecord>>,
    writes: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = SessionRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.lock();
            for rec in records {
                map.insert(rec.code.clone(), rec);
            }
        }
        store
    }

    /// Number of `set` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Synchronous read, for assertions.
    pub fn snapshot(&self, code: &str) -> Option<SessionRecord> {
        self.records.lock().get(code).cloned()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().get(code).cloned())
    }

    async fn set(&self, code: &str, record: &SessionRecord) -> Result<(), StoreError> {
        self.records.lock().insert(code.to_owned(), record.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn insert_new(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut map = self.records.lock();
        if map.contains_key(&record.code) {
            return Err(StoreError::Conflict(format!("session {}", record.code)));
        }
        map.insert(record.code.clone(), record.clone());
        Ok(())
    }
}
