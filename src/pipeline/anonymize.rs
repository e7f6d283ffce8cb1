//! Stage 4: de-identify the retrieved files.
//!
//! The engine writes its own in-progress log; on success that log is
//! promoted to the completed artifact name, which is what marks the stage
//! done. On failure the in-progress log stays where it is for diagnosis and
//! the stage remains incomplete, so a resumed run re-attempts anonymization.

use super::Pipeline;
use crate::engine::AnonymizeRequest;
use crate::errors::PipelineError;
use crate::run_context::{RunContext, artifact};

pub(super) async fn run(p: &Pipeline, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let in_progress = ctx.artifact_path(artifact::ANONYMIZE_IN_PROGRESS);
    let request = AnonymizeRequest {
        source_dir: ctx.artifact_path(artifact::FROM_STAGING),
        dest_dir: ctx.artifact_path(artifact::TO_PRODUCTION),
        quarantine_dir: ctx.artifact_path(artifact::QUARANTINE),
        audit_db: p.config.audit_db.clone(),
        allowed_modalities: p.opts.modalities.clone(),
        org_root: p.config.org_root.clone(),
        vocab_file: p.config.vocab_file.clone(),
        log_file: in_progress.clone(),
        overlay: p.config.overlay,
        profile: p.config.profile.clone(),
    };

    let succeeded = p.engine.run(&request).await.map_err(PipelineError::Other)?;
    if !succeeded {
        ctx.note(&format!(
            "Error during anonymization, see {}",
            artifact::ANONYMIZE_IN_PROGRESS
        ))
        .map_err(PipelineError::Other)?;
        return Err(PipelineError::EngineFailure { in_progress });
    }

    std::fs::rename(
        &in_progress,
        ctx.artifact_path(artifact::ANONYMIZE_OUTPUT),
    )?;
    Ok(())
}
