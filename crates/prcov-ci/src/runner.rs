//! Coverage-agent execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use prcov_core::{AgentSettings, Secret};
use tokio::process::Command;
use tracing::debug;

use crate::work::WorkItem;

/// Environment variable carrying the agent credential to the child process.
pub const AGENT_KEY_ENV: &str = "OPENAI_API_KEY";

/// Captured result of one agent process.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl AgentOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the coverage agent for one work item.
///
/// An `Err` means the process could not be run at all (spawn failure,
/// timeout); a non-zero exit is an `Ok` with that exit code.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, item: &WorkItem) -> anyhow::Result<AgentOutput>;
}

/// Spawns the external coverage agent as a subprocess.
#[derive(Debug, Clone)]
pub struct CoverAgentRunner {
    /// Program followed by fixed leading arguments, e.g. `["npx", "cover-agent"]`.
    pub command: Vec<String>,
    pub api_key: Secret,
    pub working_dir: PathBuf,
    /// 0 disables the limit.
    pub timeout_secs: u64,
}

impl CoverAgentRunner {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            command: settings
                .agent_binary
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            api_key: settings.agent_api_key.clone(),
            working_dir: settings.working_dir.clone(),
            timeout_secs: settings.timeout_secs,
        }
    }
}

#[async_trait]
impl AgentRunner for CoverAgentRunner {
    async fn run(&self, item: &WorkItem) -> anyhow::Result<AgentOutput> {
        let start = Instant::now();

        let Some((exe, leading)) = self.command.split_first() else {
            anyhow::bail!("coverage agent command is empty");
        };

        debug!(
            agent = %exe,
            source = %item.association.source_file.display(),
            test = %item.association.test_file.display(),
            "spawning coverage agent"
        );

        let child = Command::new(exe)
            .args(leading)
            .args(item.agent_args())
            .env(AGENT_KEY_ENV, self.api_key.expose())
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {exe}: {e}"))?;

        let output = if self.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(self.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "coverage agent for {} timed out after {} seconds",
                    item.association,
                    self.timeout_secs
                )
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(AgentOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
