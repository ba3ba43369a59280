//! Run configuration.
//!
//! Raw [`Inputs`] arrive from the CI runtime as optional strings. Blank values
//! are treated as absent. [`RunConfig::from_inputs`] applies defaults and
//! validation and is the only way a pipeline gets its configuration; nothing
//! downstream reads the process environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::TestAssociation;
use crate::error::{PrcovError, Result};
use crate::resolver::{ResolverStrategy, DEFAULT_ASCEND_LEVELS};

pub const DEFAULT_TEST_COMMAND: &str = "npx jest --coverage";
pub const DEFAULT_COMMENT_PREFIX: &str = "## Coverage";
pub const DEFAULT_COVERAGE_PATH: &str = "./coverage/cobertura-coverage.xml";
pub const DEFAULT_BASELINE_PATH: &str = "./coverage/initial-coverage.xml";
pub const DEFAULT_COVERAGE_KIND: &str = "cobertura";
pub const DEFAULT_DESIRED_COVERAGE: u8 = 100;
pub const DEFAULT_MAX_ITERATIONS: u32 = 2;
pub const DEFAULT_AGENT_BINARY: &str = "cover-agent";
pub const DEFAULT_RELATED_TESTS_COMMAND: &str = "npx jest --listTests --findRelatedTests";
pub const DEFAULT_BASE_BRANCH: &str = "main";

/// Placeholder in the test command replaced by the per-item report path.
pub const COVERAGE_PATH_PLACEHOLDER: &str = "{coverage_path}";

/// A credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Where the CI runtime says this run is happening.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunContext {
    /// e.g. `refs/pull/42/merge`
    pub git_ref: String,
    /// `owner/repo`
    pub repository: String,
}

/// A pull request addressed on the hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

impl RunContext {
    pub fn new(git_ref: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            git_ref: git_ref.into(),
            repository: repository.into(),
        }
    }

    /// Resolve the pull request this run belongs to.
    ///
    /// Fails with [`PrcovError::NotPullRequest`] for any ref outside `refs/pull/`.
    pub fn pull_request(&self) -> Result<PullRequestRef> {
        let not_pr = || PrcovError::NotPullRequest {
            git_ref: self.git_ref.clone(),
        };

        let rest = self.git_ref.strip_prefix("refs/pull/").ok_or_else(not_pr)?;
        let number = rest
            .split('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(not_pr)?;

        let (owner, repo) = self
            .repository
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| PrcovError::InvalidInput {
                input: "repository".to_string(),
                reason: format!("expected owner/repo, got {:?}", self.repository),
            })?;

        Ok(PullRequestRef {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        })
    }
}

/// Whether all work items share one coverage report or each gets its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportScope {
    /// One report path; invocations are serialized on it.
    #[default]
    Shared,
    /// A derived path per association; invocations run concurrently.
    PerItem,
}

impl FromStr for ReportScope {
    type Err = PrcovError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "shared" => Ok(ReportScope::Shared),
            "per-item" | "per_item" => Ok(ReportScope::PerItem),
            other => Err(PrcovError::InvalidInput {
                input: "report_scope".to_string(),
                reason: format!("expected `shared` or `per-item`, got {other:?}"),
            }),
        }
    }
}

/// Settings shared by every work item of a run.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub agent_binary: String,
    pub agent_api_key: Secret,
    pub test_command: String,
    pub coverage_path: PathBuf,
    pub coverage_kind: String,
    /// Percent, 0..=100.
    pub desired_coverage: u8,
    /// At least 1.
    pub max_iterations: u32,
    /// Opaque passthrough, split on whitespace.
    pub extra_args: String,
    pub report_scope: ReportScope,
    /// 0 disables the limit.
    pub timeout_secs: u64,
    pub working_dir: PathBuf,
}

impl AgentSettings {
    /// Coverage report the agent reads and writes for `association`.
    pub fn report_path_for(&self, association: &TestAssociation) -> PathBuf {
        match self.report_scope {
            ReportScope::Shared => self.coverage_path.clone(),
            ReportScope::PerItem => {
                let mut hasher = Sha256::new();
                hasher.update(association.source_file.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                hasher.update(association.test_file.to_string_lossy().as_bytes());
                let digest = hex::encode(hasher.finalize());

                let file_name = self
                    .coverage_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "coverage.xml".to_string());
                let name = format!("{}-{}-{}", association.source_stem(), &digest[..8], file_name);
                match self.coverage_path.parent() {
                    Some(parent) => parent.join(name),
                    None => PathBuf::from(name),
                }
            }
        }
    }

    /// Test command with the report placeholder filled in.
    pub fn test_command_for(&self, report_path: &Path) -> String {
        self.test_command
            .replace(COVERAGE_PATH_PLACEHOLDER, &report_path.to_string_lossy())
    }

    /// Extra agent arguments as discrete argv entries.
    pub fn extra_args(&self) -> Vec<String> {
        self.extra_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Raw inputs as delivered by the CI runtime.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub git_ref: Option<String>,
    pub repository: Option<String>,
    pub github_token: Option<String>,
    pub agent_api_key: Option<String>,
    pub test_command: Option<String>,
    pub comment_prefix: Option<String>,
    pub coverage_path: Option<String>,
    pub coverage_type: Option<String>,
    pub desired_coverage: Option<String>,
    pub max_iterations: Option<String>,
    pub additional_agent_args: Option<String>,
    pub agent_binary: Option<String>,
    pub agent_timeout_secs: Option<String>,
    pub max_concurrent: Option<String>,
    pub report_scope: Option<String>,
    pub baseline_path: Option<String>,
    pub resolver_strategies: Option<String>,
    pub related_tests_command: Option<String>,
    pub test_dir_ascend: Option<String>,
    pub open_follow_up_pr: Option<String>,
    pub base_branch: Option<String>,
    pub workspace_root: Option<String>,
}

/// Validated configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub context: RunContext,
    pub github_token: Secret,
    pub agent: AgentSettings,
    pub comment_prefix: String,
    /// `None` leaves the dispatcher unbounded.
    pub max_concurrent: Option<usize>,
    pub baseline_path: PathBuf,
    pub strategies: Vec<ResolverStrategy>,
    pub open_follow_up_pr: bool,
    pub base_branch: String,
    pub workspace_root: PathBuf,
}

impl RunConfig {
    /// Apply defaults and validate.
    pub fn from_inputs(inputs: Inputs) -> Result<Self> {
        let github_token = present(inputs.github_token).ok_or_else(|| PrcovError::MissingInput {
            what: "github token".to_string(),
            input: "github_token".to_string(),
        })?;
        let agent_api_key =
            present(inputs.agent_api_key).ok_or_else(|| PrcovError::MissingInput {
                what: "agent API key".to_string(),
                input: "agent_api_key".to_string(),
            })?;

        let test_command = or_default(inputs.test_command, DEFAULT_TEST_COMMAND);
        let comment_prefix = or_default(inputs.comment_prefix, DEFAULT_COMMENT_PREFIX);
        let coverage_path = PathBuf::from(or_default(inputs.coverage_path, DEFAULT_COVERAGE_PATH));
        let coverage_kind = or_default(inputs.coverage_type, DEFAULT_COVERAGE_KIND);

        let desired_coverage = match present(inputs.desired_coverage) {
            None => DEFAULT_DESIRED_COVERAGE,
            Some(raw) => parse_number::<u8>("desired_coverage", &raw)
                .and_then(|v| {
                    if v <= 100 {
                        Ok(v)
                    } else {
                        Err(invalid("desired_coverage", "must be between 0 and 100"))
                    }
                })?,
        };

        let max_iterations = match present(inputs.max_iterations) {
            None => DEFAULT_MAX_ITERATIONS,
            Some(raw) => positive::<u32>("max_iterations", &raw)?,
        };

        let extra_args = present(inputs.additional_agent_args).unwrap_or_default();
        let agent_binary = or_default(inputs.agent_binary, DEFAULT_AGENT_BINARY);

        let timeout_secs = match present(inputs.agent_timeout_secs) {
            None => 0,
            Some(raw) => parse_number::<u64>("agent_timeout_secs", &raw)?,
        };

        let max_concurrent = present(inputs.max_concurrent)
            .map(|raw| positive::<usize>("max_concurrent", &raw))
            .transpose()?;

        let report_scope = present(inputs.report_scope)
            .map(|raw| raw.parse::<ReportScope>())
            .transpose()?
            .unwrap_or_default();
        if report_scope == ReportScope::PerItem && !test_command.contains(COVERAGE_PATH_PLACEHOLDER)
        {
            return Err(invalid(
                "report_scope",
                &format!(
                    "per-item needs a test command that writes to {COVERAGE_PATH_PLACEHOLDER}"
                ),
            ));
        }

        let related_tests_command = or_default(
            inputs.related_tests_command,
            DEFAULT_RELATED_TESTS_COMMAND,
        );
        let ascend = match present(inputs.test_dir_ascend) {
            None => DEFAULT_ASCEND_LEVELS,
            Some(raw) => parse_number::<usize>("test_dir_ascend", &raw)?,
        };
        let strategies = parse_strategies(
            present(inputs.resolver_strategies).as_deref().unwrap_or("sibling"),
            ascend,
            &related_tests_command,
        )?;

        let open_follow_up_pr = match present(inputs.open_follow_up_pr) {
            None => false,
            Some(raw) => parse_bool("open_follow_up_pr", &raw)?,
        };

        let workspace_root = PathBuf::from(or_default(inputs.workspace_root, "."));

        Ok(Self {
            context: RunContext {
                git_ref: present(inputs.git_ref).unwrap_or_default(),
                repository: present(inputs.repository).unwrap_or_default(),
            },
            github_token: Secret::new(github_token),
            agent: AgentSettings {
                agent_binary,
                agent_api_key: Secret::new(agent_api_key),
                test_command,
                coverage_path,
                coverage_kind,
                desired_coverage,
                max_iterations,
                extra_args,
                report_scope,
                timeout_secs,
                working_dir: workspace_root.clone(),
            },
            comment_prefix,
            max_concurrent,
            baseline_path: PathBuf::from(or_default(inputs.baseline_path, DEFAULT_BASELINE_PATH)),
            strategies,
            open_follow_up_pr,
            base_branch: or_default(inputs.base_branch, DEFAULT_BASE_BRANCH),
            workspace_root,
        })
    }
}

/// Parse a comma list of strategy names into resolver strategies.
pub fn parse_strategies(
    raw: &str,
    ascend: usize,
    related_tests_command: &str,
) -> Result<Vec<ResolverStrategy>> {
    let mut strategies = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let strategy = match name {
            "sibling" => ResolverStrategy::Sibling,
            "test-dir" | "test_dir" => ResolverStrategy::TestDirectory { ascend },
            "runner" => {
                let command: Vec<String> = related_tests_command
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                if command.is_empty() {
                    return Err(invalid("related_tests_command", "must not be empty"));
                }
                ResolverStrategy::RunnerDelegation { command }
            }
            other => {
                return Err(invalid(
                    "resolver_strategies",
                    &format!("unknown strategy {other:?} (expected sibling, test-dir, runner)"),
                ))
            }
        };
        if !strategies.contains(&strategy) {
            strategies.push(strategy);
        }
    }
    if strategies.is_empty() {
        return Err(invalid("resolver_strategies", "at least one strategy is required"));
    }
    Ok(strategies)
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn or_default(value: Option<String>, default: &str) -> String {
    present(value).unwrap_or_else(|| default.to_string())
}

fn invalid(input: &str, reason: &str) -> PrcovError {
    PrcovError::InvalidInput {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: FromStr>(input: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| invalid(input, &format!("expected a non-negative integer, got {raw:?}")))
}

fn positive<T: FromStr + PartialEq + Default>(input: &str, raw: &str) -> Result<T> {
    let value = parse_number::<T>(input, raw)?;
    if value == T::default() {
        return Err(invalid(input, "must be at least 1"));
    }
    Ok(value)
}

fn parse_bool(input: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(input, &format!("expected true or false, got {raw:?}"))),
    }
}
