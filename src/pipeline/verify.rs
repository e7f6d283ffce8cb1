//! Stage 5: verify expected patient-protocol coverage.
//!
//! Protocol series are non-diagnostic and land in quarantine during
//! anonymization; studies flagged in review as having one should therefore
//! show up there. The difference set is reported, never fatal.

use super::Pipeline;
use crate::errors::PipelineError;
use crate::run_context::{RunContext, artifact};
use std::collections::BTreeSet;

const PROTOCOL_SERIES_DESCRIPTION: &str = "patient protocol";

pub(super) async fn run(p: &Pipeline, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let requested = ctx.read_study_list().map_err(PipelineError::Other)?;

    let reviewed: BTreeSet<String> = p
        .repo
        .protocol_studies(&requested)
        .map_err(PipelineError::Other)?
        .into_iter()
        .collect();

    let quarantine = ctx.artifact_path(artifact::QUARANTINE);
    let found: BTreeSet<String> = p
        .scanner
        .scan_dir(&quarantine)
        .await
        .map_err(PipelineError::Other)?
        .into_iter()
        .filter(|d| {
            d.series_description
                .trim()
                .eq_ignore_ascii_case(PROTOCOL_SERIES_DESCRIPTION)
        })
        .map(|d| d.study_uid)
        .collect();

    let missing: BTreeSet<String> = reviewed.difference(&found).cloned().collect();

    ctx.note(&format!(
        "{} studies marked as having a protocol series, {} studies found with protocol \
         series during anonymization.",
        reviewed.len(),
        found.len()
    ))
    .map_err(PipelineError::Other)?;
    ctx.note(&format!(
        "{} studies marked as having a protocol series but not found, see '{}'.",
        missing.len(),
        artifact::MISSING_PROTOCOL_STUDIES
    ))
    .map_err(PipelineError::Other)?;

    ctx.write_id_list(artifact::REVIEWED_PROTOCOL_STUDIES, reviewed)
        .map_err(PipelineError::Other)?;
    ctx.write_id_list(artifact::FOUND_PROTOCOL_STUDIES, found)
        .map_err(PipelineError::Other)?;
    // Written last: this is the stage's checkpoint artifact
    ctx.write_id_list(artifact::MISSING_PROTOCOL_STUDIES, missing)
        .map_err(PipelineError::Other)?;

    Ok(())
}
