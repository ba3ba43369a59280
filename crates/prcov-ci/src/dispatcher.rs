//! Work dispatcher: fan out one agent invocation per association, fan in all outcomes.
//!
//! Guarantees:
//! - every unique input association yields exactly one [`WorkOutcome`], in input order;
//! - identical pairs are collapsed before dispatch;
//! - items that target the same coverage report never run at the same time;
//! - an optional semaphore bounds simultaneously running agents;
//! - one item's failure (or panic) never cancels its siblings.
//!
//! Cancellation is cooperative: items that have not started when the abort
//! signal fires are recorded as failures; running agents are awaited.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use prcov_core::{AgentSettings, TestAssociation, WorkOutcome};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::runner::AgentRunner;
use crate::work::WorkItem;

/// stderr recorded for items skipped by an abort.
pub const CANCELLED_BEFORE_START: &str = "cancelled before start";

pub struct Dispatcher {
    runner: Arc<dyn AgentRunner>,
    limit: Option<Arc<Semaphore>>,
    abort: Option<watch::Receiver<bool>>,
}

impl Dispatcher {
    /// Unbounded dispatcher.
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self {
            runner,
            limit: None,
            abort: None,
        }
    }

    /// Bound simultaneously running agents to `max_concurrent` (at least 1).
    pub fn with_concurrency_limit(mut self, max_concurrent: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(max_concurrent.max(1))));
        self
    }

    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Run every association and wait for all of them.
    #[instrument(skip_all, fields(items = associations.len()))]
    pub async fn dispatch(
        &self,
        associations: Vec<TestAssociation>,
        settings: &AgentSettings,
    ) -> Vec<WorkOutcome> {
        let mut seen = HashSet::new();
        let unique: Vec<TestAssociation> = associations
            .into_iter()
            .filter(|a| seen.insert(a.clone()))
            .collect();

        let mut report_locks: HashMap<PathBuf, Arc<Mutex<()>>> = HashMap::new();
        let mut tasks: Vec<(TestAssociation, JoinHandle<WorkOutcome>)> = Vec::new();

        for association in unique {
            let item = WorkItem::new(association.clone(), settings);
            let report_lock = Arc::clone(report_locks.entry(item.report_path.clone()).or_default());
            let runner = Arc::clone(&self.runner);
            let limit = self.limit.clone();
            let abort = self.abort.clone();

            let task = tokio::spawn(async move {
                // Same report path => strictly one at a time.
                let _report_guard = report_lock.lock_owned().await;
                let _permit = match limit {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };

                if abort.as_ref().is_some_and(|rx| *rx.borrow()) {
                    return WorkOutcome::failed(item.association, CANCELLED_BEFORE_START);
                }

                match runner.run(&item).await {
                    Ok(output) => {
                        if output.passed() {
                            info!(
                                association = %item.association,
                                duration_ms = output.duration_ms,
                                "coverage agent succeeded"
                            );
                        } else {
                            warn!(
                                association = %item.association,
                                exit_code = output.exit_code,
                                stderr = %output.stderr.trim(),
                                "coverage agent failed"
                            );
                        }
                        WorkOutcome::from_exit(
                            item.association,
                            output.exit_code,
                            output.stdout,
                            output.stderr,
                        )
                    }
                    Err(e) => {
                        warn!(
                            association = %item.association,
                            error = %e,
                            "coverage agent did not run"
                        );
                        WorkOutcome::failed(item.association, e.to_string())
                    }
                }
            });

            tasks.push((association, task));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (association, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(association = %association, error = %e, "work item task aborted");
                    WorkOutcome::failed(association, format!("work item task aborted: {e}"))
                }
            };
            outcomes.push(outcome);
        }

        info!(
            total = outcomes.len(),
            failed = outcomes.iter().filter(|o| !o.succeeded()).count(),
            "all work items finished"
        );
        outcomes
    }
}
