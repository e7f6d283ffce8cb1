//! Stage 7: transmit the de-identified output directory to the production
//! archive. Skipped entirely in practice and no-push runs (the chain ends
//! one stage earlier).

use super::{Pipeline, write_artifact};
use crate::errors::PipelineError;
use crate::run_context::{RunContext, artifact};
use chrono::Utc;

pub(super) async fn run(p: &Pipeline, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let command = p
        .config
        .push_command(&ctx.artifact_path(artifact::TO_PRODUCTION));
    let output = p.runner.run(&command).await.map_err(PipelineError::Other)?;

    if !output.success() {
        return Err(PipelineError::CommandFailed {
            command,
            code: output.code,
            output: output.output,
        });
    }

    write_artifact(ctx, artifact::PUSH_OUTPUT, &output.output)?;
    ctx.note(&format!(
        "Push completed at {}",
        Utc::now().format("%Y-%m-%d %H:%M")
    ))
    .map_err(PipelineError::Other)?;
    Ok(())
}
