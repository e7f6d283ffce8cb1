//! Stage 2: select reviewed studies and re-validate their review records.
//!
//! A study is selected when it has a fully clean review and nothing else
//! disqualifies it, but any one of its other reviews may still contradict
//! that selection. Conflicts are enumerated exhaustively (no early stop) and
//! the selection artifact is still written so the operator can hand-edit it
//! before resuming; the pipeline then halts before retrieval.

use super::{Pipeline, write_artifact};
use crate::errors::PipelineError;
use crate::run_context::{RunContext, artifact};

pub(super) fn run(p: &Pipeline, ctx: &mut RunContext) -> Result<(), PipelineError> {
    let studies = p
        .repo
        .select_reviewed(p.opts.limit)
        .map_err(PipelineError::Other)?;

    let mut reviewed = Vec::with_capacity(studies.len());
    for study in studies {
        let reviews = p
            .repo
            .reviews_for(&study.original_uid)
            .map_err(PipelineError::Other)?;
        reviewed.push((study, reviews));
    }

    let mut conflicts = 0;
    for (study, reviews) in &reviewed {
        if reviews.iter().any(|r| r.is_disqualifying()) {
            conflicts += 1;
            let msg = format!(
                "Study {} has conflicting reviews, please address manually and continue \
                 pipeline. If an issue is found, remove the uid from {}.",
                study.original_uid,
                artifact::STUDIES_TO_RETRIEVE
            );
            eprintln!("{msg}");
            ctx.note(&msg).map_err(PipelineError::Other)?;
        }
    }

    let mut comments = String::new();
    for (study, reviews) in &reviewed {
        comments.push_str(&format!("{}:\n", study.original_uid));
        for review in reviews {
            comments.push_str(&format!("\t{}\n", review.comment));
        }
    }
    write_artifact(ctx, artifact::COMMENTS, &comments)?;

    ctx.write_id_list(
        artifact::STUDIES_TO_RETRIEVE,
        reviewed.iter().map(|(s, _)| s.original_uid.clone()),
    )
    .map_err(PipelineError::Other)?;

    ctx.note(&format!(
        "{} valid reviewed studies. Please review {}",
        reviewed.len(),
        artifact::COMMENTS
    ))
    .map_err(PipelineError::Other)?;

    if conflicts > 0 {
        return Err(PipelineError::ReviewConflict { count: conflicts });
    }
    Ok(())
}
