//! Read-only access to the identifier-mapping store written by the
//! de-identification engine.
//!
//! The store maps anonymized ("cleaned") study identifiers back to their
//! originals. It is append-only from this core's perspective; the pipeline
//! only ever queries it.

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

const GET_ORIGINAL_QUERY: &str = "SELECT original FROM studyinstanceuid WHERE cleaned = ?1";

pub trait AuditStore: Send + Sync {
    /// Original identifier for an anonymized one; `None` on a lookup miss.
    fn original_for(&self, anonymized_uid: &str) -> Result<Option<String>>;
}

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open audit store {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl AuditStore for SqliteAuditStore {
    fn original_for(&self, anonymized_uid: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("Audit store lock poisoned: {e}"))?;
        let original: Option<String> = conn
            .query_row(GET_ORIGINAL_QUERY, params![anonymized_uid], |row| {
                row.get(0)
            })
            .optional()
            .context("Audit store lookup failed")?;
        Ok(original.map(|uid| uid.trim().to_string()))
    }
}
