//! End-to-end coverage pipeline.
//!
//! change set -> test resolution -> dispatch -> aggregation -> report.
//! The only failures that escape [`CoveragePipeline::run`] are precondition
//! failures, an abort before dispatch, and hosting-API failures on the steps
//! that cannot be skipped (listing changed files, posting the summary).

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use prcov_core::{
    aggregate, collect_change_set, summarize, ChangeSetProvider, ChangedFile, CoverageDelta,
    CoverageSummary, FollowUpPullRequest, PrcovError, PullRequestRef, ReportScope, ReportSink,
    Result, RunConfig, TestAssociation, TestResolver, WorkOutcome,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::runner::AgentRunner;

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: String,

    pub pull_request: PullRequestRef,

    pub changed_files: Vec<ChangedFile>,

    /// Resolver output; every outcome's association is drawn from here.
    pub associations: Vec<TestAssociation>,

    pub outcomes: Vec<WorkOutcome>,

    pub summary: CoverageSummary,

    /// The Markdown posted to the pull request.
    pub comment: String,

    pub follow_up_url: Option<String>,

    /// Why the follow-up pull request could not be opened.
    pub follow_up_error: Option<String>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.succeeded()).count()
    }

    /// Whether every work item succeeded.
    pub fn success(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Pipeline orchestrator. Collaborators are injected; nothing is read from
/// the process environment.
pub struct CoveragePipeline {
    config: RunConfig,
    changes: Arc<dyn ChangeSetProvider>,
    sink: Arc<dyn ReportSink>,
    runner: Arc<dyn AgentRunner>,
    abort: watch::Receiver<bool>,
}

impl CoveragePipeline {
    pub fn new(
        config: RunConfig,
        changes: Arc<dyn ChangeSetProvider>,
        sink: Arc<dyn ReportSink>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        let (_never, abort) = watch::channel(false);
        Self {
            config,
            changes,
            sink,
            runner,
            abort,
        }
    }

    /// Observe `abort`; once it reads `true` no further agent is started.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = abort;
        self
    }

    fn ensure_not_aborted(&self, stage: &str) -> Result<()> {
        if *self.abort.borrow() {
            return Err(PrcovError::Aborted {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    /// Execute one run.
    #[instrument(skip(self), fields(git_ref = %self.config.context.git_ref))]
    pub async fn run(&self) -> Result<PipelineResult> {
        let start = Instant::now();

        // Preconditions: no side effects before this point.
        let pr = self.config.context.pull_request()?;
        self.ensure_not_aborted("listing changed files")?;

        let run_id = Uuid::new_v4().to_string();
        info!(run_id = %run_id, pr = %pr, "starting coverage pipeline");

        let changed_files = collect_change_set(self.changes.as_ref(), &pr).await?;

        let resolver = TestResolver::new(
            self.config.workspace_root.clone(),
            self.config.strategies.clone(),
        );
        let resolution = resolver.resolve_all(&changed_files).await;
        let mut warnings = resolution.warnings;
        info!(
            changed = changed_files.len(),
            associations = resolution.associations.len(),
            skipped_tests = resolution.skipped_tests,
            "resolved tests for change set"
        );

        self.ensure_not_aborted("dispatching work items")?;

        let root = &self.config.workspace_root;
        let current_report = root.join(&self.config.agent.coverage_path);
        let baseline_report = root.join(&self.config.baseline_path);
        let shared_report = self.config.agent.report_scope == ReportScope::Shared;
        if shared_report {
            if let Err(warning) = snapshot_baseline(&current_report, &baseline_report).await {
                warn!("{warning}");
                warnings.push(warning);
            }
        }

        let mut dispatcher =
            Dispatcher::new(Arc::clone(&self.runner)).with_abort(self.abort.clone());
        if let Some(limit) = self.config.max_concurrent {
            dispatcher = dispatcher.with_concurrency_limit(limit);
        }
        let outcomes = dispatcher
            .dispatch(resolution.associations.clone(), &self.config.agent)
            .await;

        let summary = if shared_report {
            aggregate(&baseline_report, &current_report, &outcomes).await
        } else {
            // No single report holds the combined result.
            let reason = format!(
                "each work item wrote its own report next to {}",
                self.config.agent.coverage_path.display()
            );
            summarize(&outcomes, CoverageDelta::Unavailable { reason })
        }
        .with_warnings(warnings);
        let comment = summary.render_markdown(&self.config.comment_prefix);

        self.sink.post_comment(&pr, &comment).await?;
        info!(pr = %pr, "posted coverage summary");

        let (follow_up_url, follow_up_error) = if self.config.open_follow_up_pr {
            match self.open_follow_up(&pr).await {
                Ok(url) => (url, None),
                Err(e) => {
                    warn!(error = %e, "could not open follow-up pull request");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let result = PipelineResult {
            run_id,
            pull_request: pr,
            changed_files,
            associations: resolution.associations,
            outcomes,
            summary,
            comment,
            follow_up_url,
            follow_up_error,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if result.success() {
            info!(run_id = %result.run_id, "coverage pipeline completed successfully");
        } else {
            info!(
                run_id = %result.run_id,
                failed = result.failed_count(),
                "coverage pipeline completed with failed work items"
            );
        }

        Ok(result)
    }

    async fn open_follow_up(&self, pr: &PullRequestRef) -> Result<Option<String>> {
        let head = self.sink.head_branch(pr).await?;
        let request = FollowUpPullRequest::for_branch(&head, &self.config.base_branch);
        info!(head = %request.head, base = %request.base, "opening follow-up pull request");
        self.sink.open_pull_request(pr, &request).await
    }
}

/// Copy the current report to the baseline path so it can be compared later.
async fn snapshot_baseline(current: &Path, baseline: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = baseline.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
    }
    tokio::fs::copy(current, baseline)
        .await
        .map(|_| ())
        .map_err(|e| {
            format!(
                "no baseline coverage report: cannot copy {}: {e}",
                current.display()
            )
        })
}
