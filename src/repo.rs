//! System-of-record access: study metadata, review flags, publication and
//! error status.
//!
//! The pipeline depends only on the narrow `ReviewRepository` trait. The
//! SQLite implementation mirrors the staging database schema; tests use
//! in-memory fakes.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;

/// A study row as selected for publication.
#[derive(Debug, Clone)]
pub struct Study {
    pub original_uid: String,
    pub exclude: bool,
    pub image_published: bool,
    pub processing_error: bool,
}

/// One human review record for a study. A study can have several.
#[derive(Debug, Clone)]
pub struct StudyReview {
    pub has_phi: bool,
    pub relevant: bool,
    pub has_reconstruction: bool,
    pub exclude: bool,
    pub has_protocol_series: bool,
    pub comment: String,
}

impl StudyReview {
    /// A review contradicts a clean selection when any disqualifying flag is
    /// set on it.
    pub fn is_disqualifying(&self) -> bool {
        self.has_phi || self.exclude || !self.relevant || self.has_reconstruction
    }
}

/// Publication / error status of a study, for reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct StudyStatus {
    pub image_published: bool,
    pub processing_error: bool,
}

pub trait ReviewRepository: Send + Sync {
    /// Select up to `limit` studies meeting the approval criteria: at least
    /// one fully clean review, not excluded, not published, not previously
    /// errored, and no review marked excluding.
    fn select_reviewed(&self, limit: usize) -> Result<Vec<Study>>;

    /// All review records for a study, for conflict detection and the
    /// comments artifact.
    fn reviews_for(&self, original_uid: &str) -> Result<Vec<StudyReview>>;

    /// Of the given studies, those flagged in review as containing a patient
    /// protocol series.
    fn protocol_studies(&self, original_uids: &[String]) -> Result<Vec<String>>;

    /// Status lookup by original identifier; `None` when the study is not in
    /// the system of record.
    fn study_status(&self, original_uid: &str) -> Result<Option<StudyStatus>>;

    /// Mark a study published. Idempotent; re-marking is a no-op.
    fn mark_published(&self, original_uid: &str) -> Result<()>;

    /// Mark a study as a processing error with a date and message.
    fn mark_errored(&self, original_uid: &str, date: DateTime<Utc>, message: &str) -> Result<()>;
}

pub struct SqliteReviewRepository {
    conn: Mutex<Connection>,
}

impl SqliteReviewRepository {
    /// Open (or create) the system-of-record database and ensure the schema
    /// exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open review database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS study (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_uid TEXT NOT NULL UNIQUE,
                exclude INTEGER NOT NULL DEFAULT 0,
                image_published INTEGER NOT NULL DEFAULT 0,
                processing_error INTEGER NOT NULL DEFAULT 0,
                processing_error_date TEXT,
                processing_error_msg TEXT
            );
            CREATE TABLE IF NOT EXISTS study_review (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id INTEGER NOT NULL REFERENCES study(id),
                has_phi INTEGER NOT NULL DEFAULT 0,
                relevant INTEGER NOT NULL DEFAULT 1,
                has_reconstruction INTEGER NOT NULL DEFAULT 0,
                exclude INTEGER NOT NULL DEFAULT 0,
                has_protocol_series INTEGER NOT NULL DEFAULT 0,
                comment TEXT NOT NULL DEFAULT ''
            );
            "#,
        )
        .context("Failed to run review database migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Review DB lock poisoned: {e}"))
    }

    /// Insert a study with its reviews. Intended for deployment tooling and
    /// tests.
    pub fn insert_study(&self, original_uid: &str, reviews: &[StudyReview]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO study (original_uid) VALUES (?1)",
            params![original_uid],
        )?;
        let study_id = conn.last_insert_rowid();
        for review in reviews {
            conn.execute(
                "INSERT INTO study_review
                 (study_id, has_phi, relevant, has_reconstruction, exclude,
                  has_protocol_series, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    study_id,
                    review.has_phi,
                    review.relevant,
                    review.has_reconstruction,
                    review.exclude,
                    review.has_protocol_series,
                    review.comment,
                ],
            )?;
        }
        Ok(())
    }
}

impl ReviewRepository for SqliteReviewRepository {
    fn select_reviewed(&self, limit: usize) -> Result<Vec<Study>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT s.original_uid, s.exclude, s.image_published, s.processing_error
             FROM study s
             JOIN study_review r ON r.study_id = s.id
             WHERE r.has_phi = 0 AND r.relevant = 1 AND r.has_reconstruction = 0
               AND s.exclude = 0 AND s.image_published = 0 AND s.processing_error = 0
               AND s.id NOT IN (SELECT study_id FROM study_review WHERE exclude = 1)
             ORDER BY s.id
             LIMIT ?1",
        )?;
        let studies = stmt
            .query_map(params![limit as i64], |row| {
                Ok(Study {
                    original_uid: row.get(0)?,
                    exclude: row.get(1)?,
                    image_published: row.get(2)?,
                    processing_error: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(studies)
    }

    fn reviews_for(&self, original_uid: &str) -> Result<Vec<StudyReview>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT r.has_phi, r.relevant, r.has_reconstruction, r.exclude,
                    r.has_protocol_series, r.comment
             FROM study_review r
             JOIN study s ON s.id = r.study_id
             WHERE s.original_uid = ?1
             ORDER BY r.id",
        )?;
        let reviews = stmt
            .query_map(params![original_uid], |row| {
                Ok(StudyReview {
                    has_phi: row.get(0)?,
                    relevant: row.get(1)?,
                    has_reconstruction: row.get(2)?,
                    exclude: row.get(3)?,
                    has_protocol_series: row.get(4)?,
                    comment: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reviews)
    }

    fn protocol_studies(&self, original_uids: &[String]) -> Result<Vec<String>> {
        if original_uids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; original_uids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT s.original_uid
             FROM study s
             JOIN study_review r ON r.study_id = s.id
             WHERE s.original_uid IN ({placeholders})
               AND r.has_protocol_series = 1
             ORDER BY s.original_uid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let uids = stmt
            .query_map(rusqlite::params_from_iter(original_uids), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(uids)
    }

    fn study_status(&self, original_uid: &str) -> Result<Option<StudyStatus>> {
        let conn = self.lock()?;
        let status = conn
            .query_row(
                "SELECT image_published, processing_error FROM study WHERE original_uid = ?1",
                params![original_uid],
                |row| {
                    Ok(StudyStatus {
                        image_published: row.get(0)?,
                        processing_error: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(status)
    }

    fn mark_published(&self, original_uid: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE study SET image_published = 1 WHERE original_uid = ?1",
            params![original_uid],
        )?;
        Ok(())
    }

    fn mark_errored(&self, original_uid: &str, date: DateTime<Utc>, message: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE study
             SET processing_error = 1, processing_error_date = ?2, processing_error_msg = ?3
             WHERE original_uid = ?1",
            params![original_uid, date.to_rfc3339(), message],
        )?;
        Ok(())
    }
}
