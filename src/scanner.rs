//! Descriptor scanning over retrieved, quarantined, and published files.
//!
//! Three stages need to know which study a written file belongs to (and, for
//! protocol auditing, its series description). Parsing the image format is
//! not this crate's business; the production scanner shells out to the
//! configured dump command and extracts the two attributes from its text
//! output, the same way retrieval and publish wrap the transport tools.

use crate::runner::CommandRunner;
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

pub const STUDY_UID_TAG: &str = "(0020,000d)";
pub const SERIES_DESCRIPTION_TAG: &str = "(0008,103e)";

/// Identifying attributes of one stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub study_uid: String,
    pub series_description: String,
}

#[async_trait]
pub trait DescriptorScanner: Send + Sync {
    /// Descriptors for every readable file under `dir`, recursively.
    /// Dotfiles are skipped; unreadable files are logged and skipped rather
    /// than failing the scan. A missing directory scans as empty.
    async fn scan_dir(&self, dir: &Path) -> Result<Vec<FileDescriptor>>;
}

/// Extract the bracketed value from a dump output line, e.g.
/// `(0008,103e) LO [patient protocol]  # SeriesDescription`.
fn bracketed_value(line: &str) -> Option<&str> {
    let start = line.find('[')? + 1;
    let end = line.rfind(']')?;
    (start <= end).then(|| &line[start..end])
}

/// Parse a dump command's output into a descriptor. `None` when either
/// attribute is absent.
pub fn parse_dump_output(output: &str) -> Option<FileDescriptor> {
    let mut study_uid = None;
    let mut series_description = None;
    for line in output.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains(STUDY_UID_TAG) {
            study_uid = bracketed_value(line).map(|v| v.trim().to_string());
        } else if lower.contains(SERIES_DESCRIPTION_TAG) {
            series_description = bracketed_value(line).map(|v| v.trim().to_string());
        }
    }
    Some(FileDescriptor {
        study_uid: study_uid?,
        series_description: series_description.unwrap_or_default(),
    })
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.into_path())
        .collect()
}

/// Scanner that runs the configured dump command per file.
pub struct DumpScanner {
    runner: Arc<dyn CommandRunner>,
    command_template: String,
}

impl DumpScanner {
    pub fn new(runner: Arc<dyn CommandRunner>, command_template: String) -> Self {
        Self {
            runner,
            command_template,
        }
    }
}

#[async_trait]
impl DescriptorScanner for DumpScanner {
    async fn scan_dir(&self, dir: &Path) -> Result<Vec<FileDescriptor>> {
        let mut descriptors = Vec::new();
        for file in files_under(dir) {
            let command = self
                .command_template
                .replace("{file}", &file.to_string_lossy());
            let result = match self.runner.run(&command).await {
                Ok(result) if result.success() => result,
                Ok(result) => {
                    tracing::warn!(
                        file = %file.display(),
                        code = result.code,
                        "unable to read file, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "dump command failed");
                    continue;
                }
            };
            match parse_dump_output(&result.output) {
                Some(descriptor) => descriptors.push(descriptor),
                None => {
                    tracing::warn!(file = %file.display(), "no study identifier in dump output");
                }
            }
        }
        Ok(descriptors)
    }
}
