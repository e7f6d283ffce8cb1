//! Stage 3: retrieve source files from the staging archive.
//!
//! The background listener is started before the blocking retrieval call and
//! stopped after it, on every exit path. Checkpoint-skipped runs never start
//! the listener, and `ProcessSupervisor::stop` without a start is a no-op.
//! The retrieval command's combined output becomes the stage artifact only on
//! success; on failure the output travels in the error for diagnosis and the
//! stage stays incomplete so a resumed run retries it.

use super::{Pipeline, write_artifact};
use crate::errors::PipelineError;
use crate::run_context::{RunContext, artifact};
use std::collections::BTreeSet;

pub(super) async fn run(p: &mut Pipeline, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let from_staging = ctx.artifact_path(artifact::FROM_STAGING);
    std::fs::create_dir_all(&from_staging)?;

    p.supervisor
        .start(&p.config.listener_command(&from_staging))
        .await
        .map_err(PipelineError::Other)?;

    let command = p
        .config
        .retrieve_command(&ctx.artifact_path(artifact::STUDIES_TO_RETRIEVE));
    let result = p.runner.run(&command).await;

    // Listener teardown happens before any error propagates
    let stopped = p.supervisor.stop().await;

    let output = result.map_err(PipelineError::Other)?;
    stopped.map_err(PipelineError::Other)?;

    if !output.success() {
        return Err(PipelineError::CommandFailed {
            command,
            code: output.code,
            output: output.output,
        });
    }

    write_artifact(ctx, artifact::PULL_OUTPUT, &output.output)?;

    let descriptors = p
        .scanner
        .scan_dir(&from_staging)
        .await
        .map_err(PipelineError::Other)?;
    let studies: BTreeSet<&str> = descriptors.iter().map(|d| d.study_uid.as_str()).collect();
    ctx.note(&format!(
        "Received {} files containing {} studies",
        descriptors.len(),
        studies.len()
    ))
    .map_err(PipelineError::Other)?;

    Ok(())
}
