//! The stage executor: a fixed linear chain of named stages over a run
//! directory, with artifact-existence checkpointing and halt-on-fatal-error
//! semantics.
//!
//! A stage whose declared output artifact already exists on disk is never
//! re-invoked, which is what makes resumption correct: a prior run's
//! completed stages are not redone, and a crash between stages resumes at
//! the first incomplete one. Practice and no-push runs truncate the chain
//! after the post-processing hook so dry runs never touch the production
//! archive or the system of record.

mod anonymize;
mod collect;
mod publish;
mod retrieve;
mod verify;

use crate::audit::AuditStore;
use crate::config::RelayConfig;
use crate::engine::Anonymizer;
use crate::errors::PipelineError;
use crate::hooks::HookRegistry;
use crate::reconcile::AuditReconciler;
use crate::repo::ReviewRepository;
use crate::run_context::{RunContext, artifact};
use crate::runner::CommandRunner;
use crate::scanner::DescriptorScanner;
use crate::supervisor::ProcessSupervisor;
use chrono::Utc;
use std::sync::Arc;

/// Per-invocation options from the CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of studies to select in one run.
    pub limit: usize,
    /// Suppress database mutation and production push.
    pub practice: bool,
    /// Stop after the post-processing hook stage.
    pub no_push: bool,
    /// Resume the last run directory instead of starting fresh.
    pub resume: bool,
    /// Allowed modality types, lowercase.
    pub modalities: Vec<String>,
}

/// The fixed stage chain, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    EnsureWorkingDirectory,
    CollectReviewedStudies,
    RetrieveSourceFiles,
    Anonymize,
    VerifyProtocolCoverage,
    RunPostProcessingHook,
    PublishToProduction,
    ReconcileAndMarkPublished,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::EnsureWorkingDirectory => "ensure_working_directory",
            Stage::CollectReviewedStudies => "collect_reviewed_studies",
            Stage::RetrieveSourceFiles => "retrieve_source_files",
            Stage::Anonymize => "anonymize",
            Stage::VerifyProtocolCoverage => "verify_protocol_coverage",
            Stage::RunPostProcessingHook => "run_post_processing_hook",
            Stage::PublishToProduction => "publish_to_production",
            Stage::ReconcileAndMarkPublished => "reconcile_and_mark_published",
        }
    }

    /// The output artifact whose existence marks this stage complete.
    /// `None` means the stage always runs.
    pub fn output(self, practice: bool) -> Option<&'static str> {
        match self {
            Stage::EnsureWorkingDirectory => None,
            Stage::CollectReviewedStudies => Some(artifact::STUDIES_TO_RETRIEVE),
            Stage::RetrieveSourceFiles => Some(artifact::PULL_OUTPUT),
            Stage::Anonymize => Some(artifact::ANONYMIZE_OUTPUT),
            Stage::VerifyProtocolCoverage => Some(artifact::MISSING_PROTOCOL_STUDIES),
            Stage::RunPostProcessingHook => {
                if practice {
                    Some(artifact::POST_ANON_OUTPUT_PRACTICE)
                } else {
                    Some(artifact::POST_ANON_OUTPUT)
                }
            }
            Stage::PublishToProduction => Some(artifact::PUSH_OUTPUT),
            Stage::ReconcileAndMarkPublished => Some(artifact::DONE),
        }
    }

    /// The chain for one invocation. Practice and no-push runs terminate
    /// after the hook stage.
    pub fn chain(opts: &RunOptions) -> Vec<Stage> {
        let mut stages = vec![
            Stage::EnsureWorkingDirectory,
            Stage::CollectReviewedStudies,
            Stage::RetrieveSourceFiles,
            Stage::Anonymize,
            Stage::VerifyProtocolCoverage,
            Stage::RunPostProcessingHook,
        ];
        if !opts.practice && !opts.no_push {
            stages.push(Stage::PublishToProduction);
            stages.push(Stage::ReconcileAndMarkPublished);
        }
        stages
    }
}

pub struct Pipeline {
    pub(crate) config: RelayConfig,
    pub(crate) opts: RunOptions,
    pub(crate) repo: Arc<dyn ReviewRepository>,
    pub(crate) audit: Arc<dyn AuditStore>,
    pub(crate) engine: Arc<dyn Anonymizer>,
    pub(crate) scanner: Arc<dyn DescriptorScanner>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) hooks: HookRegistry,
    pub(crate) supervisor: ProcessSupervisor,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RelayConfig,
        opts: RunOptions,
        repo: Arc<dyn ReviewRepository>,
        audit: Arc<dyn AuditStore>,
        engine: Arc<dyn Anonymizer>,
        scanner: Arc<dyn DescriptorScanner>,
        runner: Arc<dyn CommandRunner>,
        hooks: HookRegistry,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(runner.clone());
        Self {
            config,
            opts,
            repo,
            audit,
            engine,
            scanner,
            runner,
            hooks,
            supervisor,
        }
    }

    /// Run the chain over a new or resumed run directory. Any fatal stage
    /// error closes the overview log and propagates; the caller maps it to a
    /// non-zero exit status.
    pub async fn run(&mut self) -> Result<RunContext, PipelineError> {
        let mut ctx = RunContext::new_or_resume(&self.config.data_dir, self.opts.resume)
            .map_err(PipelineError::Other)?;
        let result = self.run_in(&mut ctx).await;
        ctx.close();
        result.map(|()| ctx)
    }

    async fn run_in(&mut self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        for stage in Stage::chain(&self.opts) {
            if let Some(output) = stage.output(self.opts.practice)
                && ctx.artifact_exists(output)
            {
                tracing::info!(stage = stage.name(), output, "output exists, skipping");
                continue;
            }
            tracing::info!(stage = stage.name(), "running");
            self.execute(stage, ctx).await.inspect_err(|e| {
                tracing::error!(stage = stage.name(), error = %e, "stage failed, halting");
            })?;
        }
        Ok(())
    }

    async fn execute(&mut self, stage: Stage, ctx: &mut RunContext) -> Result<(), PipelineError> {
        match stage {
            Stage::EnsureWorkingDirectory => self.ensure_working_directory(ctx),
            Stage::CollectReviewedStudies => collect::run(self, ctx),
            Stage::RetrieveSourceFiles => retrieve::run(self, ctx).await,
            Stage::Anonymize => anonymize::run(self, ctx).await,
            Stage::VerifyProtocolCoverage => verify::run(self, ctx).await,
            Stage::RunPostProcessingHook => self.run_post_processing_hook(ctx),
            Stage::PublishToProduction => publish::run(self, ctx).await,
            Stage::ReconcileAndMarkPublished => self.reconcile_and_mark_published(ctx).await,
        }
    }

    fn ensure_working_directory(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        ctx.ensure_dir().map_err(PipelineError::Other)?;
        ctx.open_log().map_err(PipelineError::Other)?;
        println!("Working directory will be {}", ctx.dir().display());
        Ok(())
    }

    fn run_post_processing_hook(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let name = &self.config.post_anon_hook;
        let hook = self
            .hooks
            .get(name)
            .ok_or_else(|| PipelineError::HookNotFound(name.clone()))?;

        let practice = self.opts.practice;
        let (run_dir, log) = ctx.dir_and_log().map_err(PipelineError::Other)?;
        let result_text = hook.run(run_dir, log, practice).map_err(PipelineError::Other)?;

        let output = if practice {
            artifact::POST_ANON_OUTPUT_PRACTICE
        } else {
            artifact::POST_ANON_OUTPUT
        };
        write_artifact(ctx, output, &format!("{result_text}\n"))
    }

    async fn reconcile_and_mark_published(
        &self,
        ctx: &mut RunContext,
    ) -> Result<(), PipelineError> {
        let requested = ctx.read_study_list().map_err(PipelineError::Other)?;
        let reconciler = AuditReconciler::new(
            self.repo.clone(),
            self.audit.clone(),
            self.scanner.clone(),
        );
        let production_dir = ctx.artifact_path(artifact::TO_PRODUCTION);
        reconciler
            .reconcile(&production_dir, &requested, ctx)
            .await
            .map_err(PipelineError::Other)?;

        write_artifact(
            ctx,
            artifact::DONE,
            &format!(
                "Pipeline completed at {}\n",
                Utc::now().format("%Y-%m-%d %H:%M")
            ),
        )
    }
}

/// Write a stage output artifact, mapping IO failures into the typed error.
pub(crate) fn write_artifact(
    ctx: &RunContext,
    name: &str,
    content: &str,
) -> Result<(), PipelineError> {
    let path = ctx.artifact_path(name);
    std::fs::write(&path, content)
        .map_err(|source| PipelineError::ArtifactWriteFailed { path, source })
}
