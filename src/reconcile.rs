//! Audit reconciliation: map what actually reached the production directory
//! back to the requested studies and record the outcome in the system of
//! record.
//!
//! Lookup misses are per-study, recoverable conditions: the study is
//! conservatively treated as not-confirmed-published and the run continues.
//! Failed studies are only marked errored when they are neither published
//! nor already errored, so an earlier, more specific error message is never
//! overwritten and resumed runs never re-mark.

use crate::audit::AuditStore;
use crate::repo::ReviewRepository;
use crate::run_context::RunContext;
use crate::scanner::DescriptorScanner;
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

pub const ANONYMIZATION_ERROR_MSG: &str =
    "Error during anonymization. Most likely this study was never found in the source PACS";

/// Outcome of one reconciliation pass, in original-identifier terms except
/// for `unreconciled`, which holds the anonymized identifiers that could not
/// be mapped back.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub published: BTreeSet<String>,
    pub failed: BTreeSet<String>,
    pub unreconciled: Vec<String>,
}

pub struct AuditReconciler {
    repo: Arc<dyn ReviewRepository>,
    audit: Arc<dyn AuditStore>,
    scanner: Arc<dyn DescriptorScanner>,
}

impl AuditReconciler {
    pub fn new(
        repo: Arc<dyn ReviewRepository>,
        audit: Arc<dyn AuditStore>,
        scanner: Arc<dyn DescriptorScanner>,
    ) -> Self {
        Self {
            repo,
            audit,
            scanner,
        }
    }

    /// Reconcile the production directory against the stage-2 selection.
    ///
    /// 1. Scan `production_dir` for anonymized study identifiers.
    /// 2. Map each back to its original; a miss excludes the study from the
    ///    pushed set and is logged.
    /// 3. Mark resolved originals published (idempotent).
    /// 4. `failed = requested - pushed`; mark each failed study errored
    ///    unless already published or already errored.
    pub async fn reconcile(
        &self,
        production_dir: &Path,
        requested: &[String],
        ctx: &mut RunContext,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let found: BTreeSet<String> = self
            .scanner
            .scan_dir(production_dir)
            .await?
            .into_iter()
            .map(|d| d.study_uid)
            .collect();

        for anonymized in &found {
            match self.audit.original_for(anonymized)? {
                Some(original) => {
                    self.repo.mark_published(&original)?;
                    report.published.insert(original);
                }
                None => {
                    let msg = format!(
                        "Unable to get original study uid for {anonymized} while trying to \
                         reconcile pushed studies with errored studies."
                    );
                    eprintln!("{msg}");
                    ctx.note(&msg)?;
                    report.unreconciled.push(anonymized.clone());
                }
            }
        }

        ctx.note(&format!(
            "{} studies marked as pushed",
            report.published.len()
        ))?;

        let requested: BTreeSet<String> = requested.iter().cloned().collect();
        report.failed = requested
            .difference(&report.published)
            .cloned()
            .collect();

        let now = Utc::now();
        for original in &report.failed {
            let Some(status) = self.repo.study_status(original)? else {
                eprintln!("Tried to mark study {original} as error, but unable to find study");
                continue;
            };
            if !status.processing_error && !status.image_published {
                self.repo
                    .mark_errored(original, now, ANONYMIZATION_ERROR_MSG)?;
            }
        }

        if !report.failed.is_empty() {
            ctx.note(&format!(
                "{} studies were not pushed: {:?}",
                report.failed.len(),
                report.failed
            ))?;
        }
        if !report.unreconciled.is_empty() {
            ctx.note(&format!(
                "{} studies could not be reconciled against the audit store",
                report.unreconciled.len()
            ))?;
        }

        Ok(report)
    }
}
