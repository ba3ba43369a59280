//! Scripted agent runner (testing only)

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::runner::{AgentOutput, AgentRunner};
use crate::work::WorkItem;

#[derive(Debug, Clone)]
enum Script {
    Exit { code: i32, stderr: String },
    Error(String),
    Panic,
}

/// Succeeds for every item unless told otherwise, keyed by test file.
///
/// Tracks call count, peak concurrency and every item it was handed.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: HashMap<PathBuf, Script>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen: Mutex<Vec<WorkItem>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` and `stderr` for items whose test file is `test_file`.
    pub fn fail_test(mut self, test_file: impl Into<PathBuf>, code: i32, stderr: &str) -> Self {
        self.scripts.insert(
            test_file.into(),
            Script::Exit {
                code,
                stderr: stderr.to_string(),
            },
        );
        self
    }

    /// Return a runner error (as if the process never started).
    pub fn error_test(mut self, test_file: impl Into<PathBuf>, detail: &str) -> Self {
        self.scripts
            .insert(test_file.into(), Script::Error(detail.to_string()));
        self
    }

    /// Panic inside the runner.
    pub fn panic_test(mut self, test_file: impl Into<PathBuf>) -> Self {
        self.scripts.insert(test_file.into(), Script::Panic);
        self
    }

    /// Sleep this long inside every run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<WorkItem> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, item: &WorkItem) -> anyhow::Result<AgentOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(item.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.scripts.get(&item.association.test_file) {
            None => Ok(AgentOutput {
                exit_code: 0,
                stdout: format!("covered {}", item.association.source_file.display()),
                stderr: String::new(),
                duration_ms: 0,
            }),
            Some(Script::Exit { code, stderr }) => Ok(AgentOutput {
                exit_code: *code,
                stdout: String::new(),
                stderr: stderr.clone(),
                duration_ms: 0,
            }),
            Some(Script::Error(detail)) => Err(anyhow::anyhow!("{detail}")),
            Some(Script::Panic) => panic!("scripted panic for {}", item.association),
        }
    }
}
