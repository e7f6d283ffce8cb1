//! End-to-end pipeline tests over a temporary data directory, with the
//! external collaborators (review repository, audit store, engine, scanner,
//! command runner) replaced by fakes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacs_relay::audit::AuditStore;
use pacs_relay::config::RelayConfig;
use pacs_relay::engine::{Anonymizer, AnonymizeRequest};
use pacs_relay::errors::PipelineError;
use pacs_relay::hooks::{HookRegistry, NoOpHook};
use pacs_relay::pipeline::{Pipeline, RunOptions};
use pacs_relay::repo::{ReviewRepository, Study, StudyReview, StudyStatus};
use pacs_relay::run_context::artifact;
use pacs_relay::runner::{CommandOutput, CommandRunner, ListenerHandle};
use pacs_relay::scanner::{DescriptorScanner, FileDescriptor};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn clean_review(comment: &str) -> StudyReview {
    StudyReview {
        has_phi: false,
        relevant: true,
        has_reconstruction: false,
        exclude: false,
        has_protocol_series: false,
        comment: comment.to_string(),
    }
}

#[derive(Default)]
struct FakeRepo {
    studies: Mutex<Vec<(String, Vec<StudyReview>)>>,
    statuses: Mutex<HashMap<String, StudyStatus>>,
    select_calls: AtomicUsize,
    publish_calls: Mutex<Vec<String>>,
    error_calls: Mutex<Vec<String>>,
}

impl FakeRepo {
    fn add_study(&self, uid: &str, reviews: Vec<StudyReview>) {
        self.studies
            .lock()
            .unwrap()
            .push((uid.to_string(), reviews));
        self.statuses.lock().unwrap().insert(
            uid.to_string(),
            StudyStatus {
                image_published: false,
                processing_error: false,
            },
        );
    }
}

impl ReviewRepository for FakeRepo {
    fn select_reviewed(&self, limit: usize) -> Result<Vec<Study>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        let statuses = self.statuses.lock().unwrap();
        Ok(self
            .studies
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, _)| {
                let status = &statuses[uid];
                !status.image_published && !status.processing_error
            })
            .take(limit)
            .map(|(uid, _)| Study {
                original_uid: uid.clone(),
                exclude: false,
                image_published: false,
                processing_error: false,
            })
            .collect())
    }

    fn reviews_for(&self, original_uid: &str) -> Result<Vec<StudyReview>> {
        Ok(self
            .studies
            .lock()
            .unwrap()
            .iter()
            .find(|(uid, _)| uid == original_uid)
            .map(|(_, reviews)| reviews.clone())
            .unwrap_or_default())
    }

    fn protocol_studies(&self, original_uids: &[String]) -> Result<Vec<String>> {
        Ok(self
            .studies
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, reviews)| {
                original_uids.contains(uid) && reviews.iter().any(|r| r.has_protocol_series)
            })
            .map(|(uid, _)| uid.clone())
            .collect())
    }

    fn study_status(&self, original_uid: &str) -> Result<Option<StudyStatus>> {
        Ok(self.statuses.lock().unwrap().get(original_uid).copied())
    }

    fn mark_published(&self, original_uid: &str) -> Result<()> {
        self.publish_calls
            .lock()
            .unwrap()
            .push(original_uid.to_string());
        if let Some(status) = self.statuses.lock().unwrap().get_mut(original_uid) {
            status.image_published = true;
        }
        Ok(())
    }

    fn mark_errored(&self, original_uid: &str, _date: DateTime<Utc>, _msg: &str) -> Result<()> {
        self.error_calls
            .lock()
            .unwrap()
            .push(original_uid.to_string());
        if let Some(status) = self.statuses.lock().unwrap().get_mut(original_uid) {
            status.processing_error = true;
        }
        Ok(())
    }
}

struct FakeAudit {
    mapping: HashMap<String, String>,
}

impl AuditStore for FakeAudit {
    fn original_for(&self, anonymized_uid: &str) -> Result<Option<String>> {
        Ok(self.mapping.get(anonymized_uid).cloned())
    }
}

/// Writes one descriptor file per configured study into the destination and
/// quarantine directories, plus the engine's in-progress log.
struct FakeEngine {
    /// (anonymized uid, series description) pairs routed to `to_production`
    production: Vec<(String, String)>,
    /// pairs routed to `quarantine`
    quarantine: Vec<(String, String)>,
    fail: AtomicBool,
    runs: AtomicUsize,
}

impl FakeEngine {
    fn new(production: &[(&str, &str)], quarantine: &[(&str, &str)]) -> Self {
        let pairs = |input: &[(&str, &str)]| {
            input
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect()
        };
        Self {
            production: pairs(production),
            quarantine: pairs(quarantine),
            fail: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Anonymizer for FakeEngine {
    async fn run(&self, request: &AnonymizeRequest) -> Result<bool> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        fs::write(&request.log_file, "engine diagnostics\n")?;
        if self.fail.load(Ordering::SeqCst) {
            return Ok(false);
        }
        for (dir, entries) in [
            (&request.dest_dir, &self.production),
            (&request.quarantine_dir, &self.quarantine),
        ] {
            fs::create_dir_all(dir)?;
            for (i, (uid, series)) in entries.iter().enumerate() {
                fs::write(dir.join(format!("file_{i}.dcm")), format!("{uid}\n{series}\n"))?;
            }
        }
        Ok(true)
    }
}

/// Reads the descriptor files the fake engine writes: first line study uid,
/// second line series description.
struct FakeScanner;

#[async_trait]
impl DescriptorScanner for FakeScanner {
    async fn scan_dir(&self, dir: &Path) -> Result<Vec<FileDescriptor>> {
        let mut descriptors = Vec::new();
        if !dir.exists() {
            return Ok(descriptors);
        }
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let content = fs::read_to_string(entry.path())?;
            let mut lines = content.lines();
            let (Some(uid), series) = (lines.next(), lines.next().unwrap_or("")) else {
                continue;
            };
            descriptors.push(FileDescriptor {
                study_uid: uid.to_string(),
                series_description: series.to_string(),
            });
        }
        Ok(descriptors)
    }
}

#[derive(Default)]
struct FakeRunner {
    commands: Mutex<Vec<String>>,
    /// Commands containing this substring fail with exit code 1.
    fail_matching: Mutex<Option<String>>,
    kills: Arc<AtomicUsize>,
    spawns: AtomicUsize,
}

struct FakeListener {
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl ListenerHandle for FakeListener {
    async fn kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        let fail = self
            .fail_matching
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| command.contains(needle));
        Ok(CommandOutput {
            code: if fail { 1 } else { 0 },
            output: if fail {
                "connection refused".to_string()
            } else {
                format!("ran: {command}")
            },
        })
    }

    async fn spawn_silenced(&self, command: &str) -> Result<Box<dyn ListenerHandle>> {
        self.commands
            .lock()
            .unwrap()
            .push(format!("spawn: {command}"));
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeListener {
            kills: self.kills.clone(),
        }))
    }
}

struct Harness {
    data: TempDir,
    repo: Arc<FakeRepo>,
    audit: Arc<FakeAudit>,
    engine: Arc<FakeEngine>,
    runner: Arc<FakeRunner>,
}

impl Harness {
    fn new(engine: FakeEngine, mapping: &[(&str, &str)]) -> Self {
        Self {
            data: TempDir::new().unwrap(),
            repo: Arc::new(FakeRepo::default()),
            audit: Arc::new(FakeAudit {
                mapping: mapping
                    .iter()
                    .map(|(a, o)| (a.to_string(), o.to_string()))
                    .collect(),
            }),
            engine: Arc::new(engine),
            runner: Arc::new(FakeRunner::default()),
        }
    }

    fn pipeline(&self, opts: RunOptions) -> Pipeline {
        let config = RelayConfig {
            data_dir: self.data.path().to_path_buf(),
            ..RelayConfig::default()
        };
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(NoOpHook), None).unwrap();
        Pipeline::new(
            config,
            opts,
            self.repo.clone(),
            self.audit.clone(),
            self.engine.clone(),
            Arc::new(FakeScanner),
            self.runner.clone(),
            hooks,
        )
    }
}

fn full_run_opts(resume: bool) -> RunOptions {
    RunOptions {
        limit: 10,
        practice: false,
        no_push: false,
        resume,
        modalities: vec!["mr".into(), "ct".into()],
    }
}

fn run_dir(data: &TempDir) -> std::path::PathBuf {
    let mut dirs: Vec<_> = fs::read_dir(data.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    assert_eq!(dirs.len(), 1, "expected exactly one run directory");
    dirs.pop().unwrap()
}

#[tokio::test]
async fn full_run_produces_all_artifacts_and_marks_outcomes() {
    let harness = Harness::new(
        FakeEngine::new(&[("A1", "axial"), ("A3", "axial")], &[]),
        &[("A1", "S1"), ("A3", "S3")],
    );
    harness.repo.add_study("S1", vec![clean_review("fine")]);
    harness.repo.add_study("S2", vec![clean_review("fine")]);
    harness.repo.add_study("S3", vec![clean_review("fine")]);

    let mut pipeline = harness.pipeline(full_run_opts(false));
    let ctx = pipeline.run().await.unwrap();

    for name in [
        artifact::STUDIES_TO_RETRIEVE,
        artifact::COMMENTS,
        artifact::PULL_OUTPUT,
        artifact::ANONYMIZE_OUTPUT,
        artifact::REVIEWED_PROTOCOL_STUDIES,
        artifact::FOUND_PROTOCOL_STUDIES,
        artifact::MISSING_PROTOCOL_STUDIES,
        artifact::POST_ANON_OUTPUT,
        artifact::PUSH_OUTPUT,
        artifact::DONE,
        artifact::OVERVIEW,
    ] {
        assert!(ctx.artifact_exists(name), "missing artifact {name}");
    }
    // In-progress log was promoted
    assert!(!ctx.artifact_exists(artifact::ANONYMIZE_IN_PROGRESS));

    // S1 and S3 published, S2 (never anonymized) marked errored
    assert_eq!(*harness.repo.publish_calls.lock().unwrap(), vec!["S1", "S3"]);
    assert_eq!(*harness.repo.error_calls.lock().unwrap(), vec!["S2"]);

    // Listener was started and torn down around retrieval
    assert_eq!(harness.runner.spawns.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runner.kills.load(Ordering::SeqCst), 1);

    let overview = fs::read_to_string(ctx.artifact_path(artifact::OVERVIEW)).unwrap();
    assert!(overview.contains("3 valid reviewed studies"));
    assert!(overview.contains("2 studies marked as pushed"));
    assert!(overview.contains("1 studies were not pushed"));
    assert!(overview.contains("Push completed at"));
}

#[tokio::test]
async fn resumed_run_skips_completed_stages_without_side_effects() {
    let harness = Harness::new(FakeEngine::new(&[("A1", "axial")], &[]), &[("A1", "S1")]);
    harness.repo.add_study("S1", vec![clean_review("fine")]);

    let mut pipeline = harness.pipeline(full_run_opts(false));
    pipeline.run().await.unwrap();

    let selects = harness.repo.select_calls.load(Ordering::SeqCst);
    let engine_runs = harness.engine.runs.load(Ordering::SeqCst);
    let commands = harness.runner.commands.lock().unwrap().len();
    let publishes = harness.repo.publish_calls.lock().unwrap().len();

    // Everything is checkpointed; replay executes no stage bodies
    let mut replay = harness.pipeline(full_run_opts(true));
    replay.run().await.unwrap();

    assert_eq!(harness.repo.select_calls.load(Ordering::SeqCst), selects);
    assert_eq!(harness.engine.runs.load(Ordering::SeqCst), engine_runs);
    assert_eq!(harness.runner.commands.lock().unwrap().len(), commands);
    assert_eq!(harness.repo.publish_calls.lock().unwrap().len(), publishes);

    // The overview shows both invocations against the same run directory
    let overview = fs::read_to_string(run_dir(&harness.data).join(artifact::OVERVIEW)).unwrap();
    assert_eq!(overview.matches("Starting at").count(), 2);
}

#[tokio::test]
async fn conflicting_reviews_halt_before_retrieval_but_write_triage_artifacts() {
    let harness = Harness::new(FakeEngine::new(&[], &[]), &[]);
    harness.repo.add_study(
        "S1",
        vec![
            clean_review("looks clean"),
            StudyReview {
                has_phi: true,
                ..clean_review("second reviewer saw PHI")
            },
        ],
    );
    harness.repo.add_study("S2", vec![clean_review("fine")]);

    let mut pipeline = harness.pipeline(full_run_opts(false));
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::ReviewConflict { count: 1 }));

    let dir = run_dir(&harness.data);
    // Selection and comments written for manual triage
    let selection = fs::read_to_string(dir.join(artifact::STUDIES_TO_RETRIEVE)).unwrap();
    assert!(selection.contains("S1"));
    assert!(selection.contains("S2"));
    let comments = fs::read_to_string(dir.join(artifact::COMMENTS)).unwrap();
    assert!(comments.contains("second reviewer saw PHI"));

    // But retrieval never ran
    assert!(!dir.join(artifact::PULL_OUTPUT).exists());
    assert_eq!(harness.runner.spawns.load(Ordering::SeqCst), 0);
    assert_eq!(harness.engine.runs.load(Ordering::SeqCst), 0);

    let overview = fs::read_to_string(dir.join(artifact::OVERVIEW)).unwrap();
    assert!(overview.contains("Study S1 has conflicting reviews"));
}

#[tokio::test]
async fn retrieval_failure_is_fatal_and_still_tears_down_listener() {
    let harness = Harness::new(FakeEngine::new(&[], &[]), &[]);
    harness.repo.add_study("S1", vec![clean_review("fine")]);
    *harness.runner.fail_matching.lock().unwrap() = Some("retrieve".to_string());

    let mut pipeline = harness.pipeline(full_run_opts(false));
    let err = pipeline.run().await.unwrap_err();
    match err {
        PipelineError::CommandFailed { code, output, .. } => {
            assert_eq!(code, 1);
            assert!(output.contains("connection refused"));
        }
        other => panic!("expected CommandFailed, got {other}"),
    }

    // No pull artifact: the stage stays incomplete for resume
    assert!(!run_dir(&harness.data).join(artifact::PULL_OUTPUT).exists());
    // Supervisor teardown still happened
    assert_eq!(harness.runner.spawns.load(Ordering::SeqCst), 1);
    assert_eq!(harness.runner.kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn engine_failure_leaves_in_progress_log_and_resume_retries() {
    let harness = Harness::new(FakeEngine::new(&[("A1", "axial")], &[]), &[("A1", "S1")]);
    harness.repo.add_study("S1", vec![clean_review("fine")]);
    harness.engine.fail.store(true, Ordering::SeqCst);

    let mut pipeline = harness.pipeline(full_run_opts(false));
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::EngineFailure { .. }));

    let dir = run_dir(&harness.data);
    assert!(dir.join(artifact::ANONYMIZE_IN_PROGRESS).exists());
    assert!(!dir.join(artifact::ANONYMIZE_OUTPUT).exists());

    // Operator fixes the cause; a resumed run re-attempts anonymization only
    harness.engine.fail.store(false, Ordering::SeqCst);
    let selects = harness.repo.select_calls.load(Ordering::SeqCst);
    let mut resumed = harness.pipeline(full_run_opts(true));
    resumed.run().await.unwrap();

    assert_eq!(harness.repo.select_calls.load(Ordering::SeqCst), selects);
    assert_eq!(harness.engine.runs.load(Ordering::SeqCst), 2);
    assert!(dir.join(artifact::ANONYMIZE_OUTPUT).exists());
    assert!(dir.join(artifact::DONE).exists());
}

#[tokio::test]
async fn practice_mode_stops_after_hook_and_mutates_nothing() {
    let harness = Harness::new(FakeEngine::new(&[("A1", "axial")], &[]), &[("A1", "S1")]);
    harness.repo.add_study("S1", vec![clean_review("fine")]);

    let mut opts = full_run_opts(false);
    opts.practice = true;
    let mut pipeline = harness.pipeline(opts);
    let ctx = pipeline.run().await.unwrap();

    assert!(ctx.artifact_exists(artifact::POST_ANON_OUTPUT_PRACTICE));
    assert!(!ctx.artifact_exists(artifact::POST_ANON_OUTPUT));
    assert!(!ctx.artifact_exists(artifact::PUSH_OUTPUT));
    assert!(!ctx.artifact_exists(artifact::DONE));
    assert!(harness.repo.publish_calls.lock().unwrap().is_empty());
    assert!(harness.repo.error_calls.lock().unwrap().is_empty());

    // No push command was issued
    let commands = harness.runner.commands.lock().unwrap();
    assert!(!commands.iter().any(|c| c.starts_with("dcmsnd")));
}

#[tokio::test]
async fn protocol_coverage_reports_missing_without_halting() {
    // S1 flagged as having a protocol series, but quarantine only holds S2's
    let harness = Harness::new(
        FakeEngine::new(
            &[("A1", "axial"), ("A2", "axial")],
            &[("A2", "Patient Protocol")],
        ),
        &[("A1", "S1"), ("A2", "S2")],
    );
    harness.repo.add_study(
        "S1",
        vec![StudyReview {
            has_protocol_series: true,
            ..clean_review("protocol expected")
        }],
    );
    harness.repo.add_study("S2", vec![clean_review("fine")]);

    let mut pipeline = harness.pipeline(full_run_opts(false));
    let ctx = pipeline.run().await.unwrap();

    let reviewed =
        fs::read_to_string(ctx.artifact_path(artifact::REVIEWED_PROTOCOL_STUDIES)).unwrap();
    assert_eq!(reviewed, "S1\n");
    let found = fs::read_to_string(ctx.artifact_path(artifact::FOUND_PROTOCOL_STUDIES)).unwrap();
    assert_eq!(found, "A2\n");
    let missing =
        fs::read_to_string(ctx.artifact_path(artifact::MISSING_PROTOCOL_STUDIES)).unwrap();
    assert_eq!(missing, "S1\n");

    // The discrepancy did not stop the run
    assert!(ctx.artifact_exists(artifact::DONE));
}
