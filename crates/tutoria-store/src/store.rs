use async_trait::async_trait;

use tutoria_core::SessionRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::sessions::SessionRepo;

/// Key-value persistence of session records, keyed by session code.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn set(&self, code: &str, record: &SessionRecord) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Store a record for a newly issued code; `Conflict` if the code is taken.
    async fn insert_new(&self, record: &SessionRecord) -> Result<(), StoreError>;
}

/// SQLite-backed store. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqliteSessionStore {
    repo: SessionRepo,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: SessionRepo::new(db),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(SessionRepo) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.repo.clone();
        tokio::task::spawn_blocking(move || f(repo)).await?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError> {
        let code = code.to_owned();
        self.blocking(move |repo| repo.get(&code)).await
    }

    async fn set(&self, code: &str, record: &SessionRecord) -> Result<(), StoreError> {
        let code = code.to_owned();
        let record = record.clone();
        self.blocking(move |repo| repo.put(&code, &record)).await
    }

    async fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.blocking(|repo| repo.list()).await
    }

    async fn insert_new(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |repo| repo.create(&record)).await
    }
}
