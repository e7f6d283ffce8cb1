//! De-identification engine seam.
//!
//! The engine is an external collaborator with a fixed input contract: it
//! reads the retrieved files, routes each into the destination or quarantine
//! directory, appends identifier mappings to the audit store, and writes an
//! in-progress log. It reports overall success as a boolean; promotion of
//! the in-progress log to the completed artifact is the pipeline's job, not
//! the engine's.

use crate::runner::CommandRunner;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Full input contract of the de-identification engine.
#[derive(Debug, Clone)]
pub struct AnonymizeRequest {
    pub source_dir: PathBuf,
    pub dest_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub audit_db: PathBuf,
    pub allowed_modalities: Vec<String>,
    pub org_root: String,
    pub vocab_file: PathBuf,
    pub log_file: PathBuf,
    pub overlay: bool,
    pub profile: String,
}

#[async_trait]
pub trait Anonymizer: Send + Sync {
    /// Run the engine to completion. `Ok(true)` means every file was routed;
    /// `Ok(false)` means the engine itself reported failure (diagnostics in
    /// the in-progress log). `Err` is reserved for not being able to run the
    /// engine at all.
    async fn run(&self, request: &AnonymizeRequest) -> Result<bool>;
}

/// Invokes the configured external engine command.
pub struct CommandAnonymizer {
    runner: Arc<dyn CommandRunner>,
    command_template: String,
}

impl CommandAnonymizer {
    pub fn new(runner: Arc<dyn CommandRunner>, command_template: String) -> Self {
        Self {
            runner,
            command_template,
        }
    }

    fn render(&self, request: &AnonymizeRequest) -> String {
        self.command_template
            .replace("{source}", &request.source_dir.to_string_lossy())
            .replace("{dest}", &request.dest_dir.to_string_lossy())
            .replace("{quarantine}", &request.quarantine_dir.to_string_lossy())
            .replace("{audit}", &request.audit_db.to_string_lossy())
            .replace("{modalities}", &request.allowed_modalities.join(","))
            .replace("{org_root}", &request.org_root)
            .replace("{vocab}", &request.vocab_file.to_string_lossy())
            .replace("{log}", &request.log_file.to_string_lossy())
            .replace("{profile}", &request.profile)
            .replace("{overlay}", if request.overlay { " --overlay" } else { "" })
    }
}

#[async_trait]
impl Anonymizer for CommandAnonymizer {
    async fn run(&self, request: &AnonymizeRequest) -> Result<bool> {
        let command = self.render(request);
        let result = self.runner.run(&command).await?;
        if !result.success() {
            tracing::warn!(code = result.code, "de-identification engine failed");
        }
        Ok(result.success())
    }
}
