//! Run directory ownership, resume selection, and the durable overview log.
//!
//! A run is identified by a `run_at_<unix_timestamp>` directory under the
//! data directory. Resuming selects the directory with the largest timestamp;
//! if none exist, resume behaves exactly like a fresh run. Stage completion is
//! tracked purely by the existence of each stage's output artifact inside the
//! run directory, so a crash between stages resumes at the first incomplete
//! one.

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Artifact and subdirectory names, relative to the run directory.
pub mod artifact {
    pub const OVERVIEW: &str = "overview.txt";
    pub const STUDIES_TO_RETRIEVE: &str = "studies_to_retrieve.txt";
    pub const COMMENTS: &str = "comments.txt";
    pub const PULL_OUTPUT: &str = "pull_output.txt";
    pub const ANONYMIZE_IN_PROGRESS: &str = "anonymize_in_progress.txt";
    pub const ANONYMIZE_OUTPUT: &str = "anonymize_output.txt";
    pub const REVIEWED_PROTOCOL_STUDIES: &str = "reviewed_protocol_studies.txt";
    pub const FOUND_PROTOCOL_STUDIES: &str = "found_protocol_studies.txt";
    pub const MISSING_PROTOCOL_STUDIES: &str = "missing_protocol_studies.txt";
    pub const POST_ANON_OUTPUT: &str = "post_anon_output.txt";
    pub const POST_ANON_OUTPUT_PRACTICE: &str = "post_anon_output_practice.txt";
    pub const PUSH_OUTPUT: &str = "push_output.txt";
    pub const DONE: &str = "done.txt";

    pub const FROM_STAGING: &str = "from_staging";
    pub const TO_PRODUCTION: &str = "to_production";
    pub const QUARANTINE: &str = "quarantine";
}

static RUN_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^run_at_(\d+)$").expect("valid run directory regex"));

/// Append-only progress log inside the run directory. Every write is flushed
/// and fsynced before returning, so the log reflects true progress even
/// across abrupt process termination.
#[derive(Debug)]
pub struct OverviewLog {
    file: File,
}

impl OverviewLog {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open overview log {}", path.display()))?;
        Ok(Self { file })
    }

    /// Write one line, flush, and force it to durable storage.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}").context("Failed to write overview entry")?;
        self.file.flush().context("Failed to flush overview log")?;
        self.file
            .sync_all()
            .context("Failed to sync overview log")?;
        Ok(())
    }
}

/// Owns the working directory for one pipeline invocation.
#[derive(Debug)]
pub struct RunContext {
    run_id: i64,
    dir: PathBuf,
    log: Option<OverviewLog>,
}

impl RunContext {
    /// Select the run directory for this invocation.
    ///
    /// With `resume_requested`, scans `data_dir` for `run_at_<timestamp>`
    /// subdirectories and resumes the one with the largest timestamp. No
    /// prior run is not an error: the selection falls back to a fresh
    /// directory named with the current timestamp. Without
    /// `resume_requested`, always starts fresh.
    pub fn new_or_resume(data_dir: &Path, resume_requested: bool) -> Result<Self> {
        if resume_requested {
            if let Some((run_id, dir)) = Self::find_last_run(data_dir)? {
                return Ok(Self {
                    run_id,
                    dir,
                    log: None,
                });
            }
        }
        let run_id = Utc::now().timestamp();
        let dir = data_dir.join(format!("run_at_{run_id}"));
        Ok(Self {
            run_id,
            dir,
            log: None,
        })
    }

    fn find_last_run(data_dir: &Path) -> Result<Option<(i64, PathBuf)>> {
        if !data_dir.exists() {
            return Ok(None);
        }
        let mut last: Option<(i64, PathBuf)> = None;
        for entry in fs::read_dir(data_dir)
            .with_context(|| format!("Failed to list data directory {}", data_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(captures) = RUN_DIR_RE.captures(&name) else {
                continue;
            };
            let Ok(ts) = captures[1].parse::<i64>() else {
                continue;
            };
            if last.as_ref().is_none_or(|(prev, _)| ts > *prev) {
                last = Some((ts, entry.path()));
            }
        }
        Ok(last)
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the run directory if needed. Idempotent.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create run directory {}", self.dir.display()))?;
        Ok(())
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn artifact_exists(&self, name: &str) -> bool {
        self.artifact_path(name).exists()
    }

    /// Open the append-mode overview log and record the start of this
    /// invocation. No-op if the log is already open.
    pub fn open_log(&mut self) -> Result<()> {
        if self.log.is_some() {
            return Ok(());
        }
        let mut log = OverviewLog::open(&self.artifact_path(artifact::OVERVIEW))?;
        log.write_line(&format!(
            "Starting at {}",
            Utc::now().format("%Y-%m-%d %H:%M")
        ))?;
        self.log = Some(log);
        Ok(())
    }

    /// Write a line to the overview log (if open) and mirror it to tracing.
    pub fn note(&mut self, message: &str) -> Result<()> {
        tracing::info!("{message}");
        if let Some(log) = self.log.as_mut() {
            log.write_line(message)?;
        }
        Ok(())
    }

    /// Borrow the run directory and the open overview log together, for the
    /// hook contract.
    pub fn dir_and_log(&mut self) -> Result<(&Path, &mut OverviewLog)> {
        let log = self
            .log
            .as_mut()
            .context("Overview log is not open")?;
        Ok((&self.dir, log))
    }

    /// Close the overview log. Idempotent; safe when no log was ever opened.
    pub fn close(&mut self) {
        self.log = None;
    }

    /// Read the stage-2 selection artifact: trimmed, newline-delimited
    /// original study identifiers.
    pub fn read_study_list(&self) -> Result<Vec<String>> {
        let path = self.artifact_path(artifact::STUDIES_TO_RETRIEVE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read study list {}", path.display()))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Write a newline-delimited identifier set artifact.
    pub fn write_id_list(&self, name: &str, ids: impl IntoIterator<Item = String>) -> Result<()> {
        let path = self.artifact_path(name);
        let mut content = String::new();
        for id in ids {
            content.push_str(&id);
            content.push('\n');
        }
        fs::write(&path, content)
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        Ok(())
    }
}
