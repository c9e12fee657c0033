use rusqlite::OptionalExtension;
use tracing::instrument;

use tutoria_core::SessionRecord;

use crate::database::Database;
use crate::error::StoreError;

/// Synchronous access to the `sessions` table.
#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a record for a newly issued code. Fails if the code exists.
    #[instrument(skip(self, record), fields(code = %record.code))]
    pub fn create(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions (code, owner_identity, is_vm_running, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    record.code,
                    record.owner_identity,
                    record.is_vm_running,
                    json,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("session {}", record.code)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, code: &str) -> Result<Option<SessionRecord>, StoreError> {
        let raw: Option<String> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT record FROM sessions WHERE code = ?1", [code], |row| row.get(0))
                .optional()?)
        })?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    /// Write the full record under `code`, replacing any previous one.
    #[instrument(skip(self, record), fields(running = record.is_vm_running))]
    pub fn put(&self, code: &str, record: &SessionRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (code, owner_identity, is_vm_running, record, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(code) DO UPDATE SET
                     owner_identity = excluded.owner_identity,
                     is_vm_running = excluded.is_vm_running,
                     record = excluded.record,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    code,
                    record.owner_identity,
                    record.is_vm_running,
                    json,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// All records, ordered by code.
    pub fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows: Vec<String> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT record FROM sessions ORDER BY code")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    /// Codes whose stored record claims a running sandbox.
    pub fn running_codes(&self) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT code FROM sessions WHERE is_vm_running = 1 ORDER BY code")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
    }
}
