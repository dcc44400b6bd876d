use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::types::{ActivityKind, ActivityRecord};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

// ---------------------------------------------------------------------------
// ActivityLedger
// ---------------------------------------------------------------------------

/// Append-only audit log backed by SQLite.
///
/// Rows are keyed by task id and ordered by insertion (rowid). Nothing
/// is ever updated or deleted; the ledger is for monitoring and audit,
/// never control flow.
pub struct ActivityLedger {
    conn: Mutex<Connection>,
}

impl ActivityLedger {
    /// Open (or create) a ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory ledger, useful for tests.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task_activities (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id    TEXT NOT NULL,
                kind       TEXT NOT NULL,
                message    TEXT NOT NULL,
                details    TEXT NOT NULL DEFAULT 'null',
                timestamp  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_activities_task
                ON task_activities (task_id, id);",
        )?;
        Ok(())
    }

    /// Append one record. Insertion order is preserved per task.
    pub fn append(&self, record: &ActivityRecord) -> Result<(), LedgerError> {
        let details = serde_json::to_string(&record.details)?;
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        conn.execute(
            "INSERT INTO task_activities (task_id, kind, message, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.task_id.to_string(),
                record.kind.as_str(),
                record.message,
                details,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All records for a task, oldest first.
    pub fn for_task(&self, task_id: &Uuid) -> Result<Vec<ActivityRecord>, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, message, details, timestamp
             FROM task_activities WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (task_id, kind, message, details, timestamp) = row?;
            let task_id = task_id
                .parse::<Uuid>()
                .map_err(|e| LedgerError::CorruptRow(e.to_string()))?;
            let kind = ActivityKind::from_name(&kind)
                .ok_or_else(|| LedgerError::CorruptRow(format!("unknown kind: {kind}")))?;
            let timestamp = timestamp
                .parse::<DateTime<Utc>>()
                .map_err(|e| LedgerError::CorruptRow(e.to_string()))?;
            records.push(ActivityRecord {
                task_id,
                kind,
                message,
                details: serde_json::from_str(&details)?,
                timestamp,
            });
        }
        Ok(records)
    }

    /// Total row count (all tasks).
    pub fn len(&self) -> Result<usize, LedgerError> {
        let conn = self.conn.lock().expect("ledger mutex poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM task_activities", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
