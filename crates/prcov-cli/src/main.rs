//! prcov - coverage agent orchestration for pull requests
//!
//! ## Commands
//!
//! - `run`: resolve tests for a pull request's changes, run the coverage
//!   agent for each, and report the result on the pull request
//! - `resolve`: print the test associations for local files (no API calls)

mod github;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use prcov_ci::{CoverAgentRunner, CoveragePipeline, PipelineResult};
use prcov_core::{
    config::parse_strategies, ChangedFile, Inputs, RunConfig, RunContext, TestResolver,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use crate::github::{GitHubClient, DEFAULT_API_URL};

#[derive(Parser)]
#[command(name = "prcov")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Run a coverage agent against the tests of a pull request's changes",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for the current pull request
    Run(Box<RunArgs>),

    /// Print the test associations for the given source files
    Resolve {
        /// Source files, relative to --root
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory the files are resolved against
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Comma list of sibling, test-dir, runner
        #[arg(long, default_value = "sibling")]
        strategies: String,

        /// Ancestor levels searched by the test-dir strategy
        #[arg(long, default_value_t = 1)]
        ascend: usize,

        /// Command used by the runner strategy; the source path is appended
        #[arg(long, default_value = "npx jest --listTests --findRelatedTests")]
        related_tests_command: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Git ref of the triggering event (must be refs/pull/<n>/...)
    #[arg(long, env = "GITHUB_REF")]
    git_ref: Option<String>,

    /// Repository as owner/name
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repository: Option<String>,

    /// Hosting API base URL
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Repository credential
    #[arg(long, env = "INPUT_GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Coverage agent credential, passed to the agent's environment
    #[arg(long, env = "INPUT_AGENT_API_KEY", hide_env_values = true)]
    agent_api_key: Option<String>,

    #[arg(long, env = "INPUT_TEST_COMMAND")]
    test_command: Option<String>,

    #[arg(long, env = "INPUT_COMMENT_PREFIX")]
    comment_prefix: Option<String>,

    #[arg(long, env = "INPUT_COVERAGE_PATH")]
    coverage_path: Option<String>,

    #[arg(long, env = "INPUT_COVERAGE_TYPE")]
    coverage_type: Option<String>,

    #[arg(long, env = "INPUT_DESIRED_COVERAGE")]
    desired_coverage: Option<String>,

    #[arg(long, env = "INPUT_MAX_ITERATIONS")]
    max_iterations: Option<String>,

    /// Extra agent arguments, split on whitespace
    #[arg(long, env = "INPUT_ADDITIONAL_AGENT_ARGS", allow_hyphen_values = true)]
    additional_agent_args: Option<String>,

    #[arg(long, env = "INPUT_AGENT_BINARY")]
    agent_binary: Option<String>,

    /// Per-invocation agent timeout in seconds (0 = none)
    #[arg(long, env = "INPUT_AGENT_TIMEOUT_SECS")]
    agent_timeout_secs: Option<String>,

    /// Maximum agent processes running at once
    #[arg(long, env = "INPUT_MAX_CONCURRENT")]
    max_concurrent: Option<String>,

    /// shared or per-item
    #[arg(long, env = "INPUT_REPORT_SCOPE")]
    report_scope: Option<String>,

    #[arg(long, env = "INPUT_BASELINE_PATH")]
    baseline_path: Option<String>,

    /// Comma list of sibling, test-dir, runner
    #[arg(long, env = "INPUT_RESOLVER_STRATEGIES")]
    resolver_strategies: Option<String>,

    #[arg(long, env = "INPUT_RELATED_TESTS_COMMAND")]
    related_tests_command: Option<String>,

    #[arg(long, env = "INPUT_TEST_DIR_ASCEND")]
    test_dir_ascend: Option<String>,

    /// Open a <branch>-test pull request after reporting
    #[arg(long, env = "INPUT_OPEN_FOLLOW_UP_PR")]
    open_follow_up_pr: Option<String>,

    #[arg(long, env = "INPUT_BASE_BRANCH")]
    base_branch: Option<String>,

    #[arg(long, env = "GITHUB_WORKSPACE")]
    workspace_root: Option<String>,

    /// Write the run result as JSON to this file ("-" for stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Exit non-zero when any work item failed
    #[arg(long)]
    strict: bool,
}

impl RunArgs {
    fn inputs(&self) -> Inputs {
        Inputs {
            git_ref: self.git_ref.clone(),
            repository: self.repository.clone(),
            github_token: self.github_token.clone(),
            agent_api_key: self.agent_api_key.clone(),
            test_command: self.test_command.clone(),
            comment_prefix: self.comment_prefix.clone(),
            coverage_path: self.coverage_path.clone(),
            coverage_type: self.coverage_type.clone(),
            desired_coverage: self.desired_coverage.clone(),
            max_iterations: self.max_iterations.clone(),
            additional_agent_args: self.additional_agent_args.clone(),
            agent_binary: self.agent_binary.clone(),
            agent_timeout_secs: self.agent_timeout_secs.clone(),
            max_concurrent: self.max_concurrent.clone(),
            report_scope: self.report_scope.clone(),
            baseline_path: self.baseline_path.clone(),
            resolver_strategies: self.resolver_strategies.clone(),
            related_tests_command: self.related_tests_command.clone(),
            test_dir_ascend: self.test_dir_ascend.clone(),
            open_follow_up_pr: self.open_follow_up_pr.clone(),
            base_branch: self.base_branch.clone(),
            workspace_root: self.workspace_root.clone(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    prcov_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(*args).await,
        Commands::Resolve {
            files,
            root,
            strategies,
            ascend,
            related_tests_command,
        } => cmd_resolve(files, root, &strategies, ascend, &related_tests_command).await,
    }
}

/// Check the run context before any other input so a run outside a pull
/// request reports exactly that.
fn load_config(args: &RunArgs) -> Result<RunConfig> {
    RunContext::new(
        args.git_ref.clone().unwrap_or_default(),
        args.repository.clone().unwrap_or_default(),
    )
    .pull_request()?;
    Ok(RunConfig::from_inputs(args.inputs())?)
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;

    let github = Arc::new(
        GitHubClient::new(&args.api_url, config.github_token.clone())
            .context("Failed to create GitHub client")?,
    );
    let runner = Arc::new(CoverAgentRunner::from_settings(&config.agent));

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; no further agents will be started");
            let _ = abort_tx.send(true);
        }
    });

    let pipeline =
        CoveragePipeline::new(config, github.clone(), github, runner).with_abort(abort_rx);
    let result = pipeline.run().await?;

    print_summary(&result);
    if let Some(output) = &args.output {
        write_result(&result, output).await?;
    }

    if args.strict && !result.success() {
        bail!("{} of {} work item(s) failed", result.failed_count(), result.outcomes.len());
    }
    Ok(())
}

fn print_summary(result: &PipelineResult) {
    info!(
        run_id = %result.run_id,
        pr = %result.pull_request,
        changed = result.changed_files.len(),
        associations = result.associations.len(),
        passed = result.passed_count(),
        failed = result.failed_count(),
        duration_ms = result.duration_ms,
        "run finished"
    );
    if let Some(url) = &result.follow_up_url {
        info!(url = %url, "opened follow-up pull request");
    }
    if let Some(error) = &result.follow_up_error {
        warn!(error = %error, "follow-up pull request was not opened");
    }
}

async fn write_result(result: &PipelineResult, output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize run result")?;
    if output.as_os_str() == "-" {
        println!("{json}");
        return Ok(());
    }
    tokio::fs::write(output, json)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(path = %output.display(), "wrote run result");
    Ok(())
}

async fn cmd_resolve(
    files: Vec<PathBuf>,
    root: PathBuf,
    strategies: &str,
    ascend: usize,
    related_tests_command: &str,
) -> Result<()> {
    let strategies = parse_strategies(strategies, ascend, related_tests_command)?;
    let resolver = TestResolver::new(root, strategies);
    let changed: Vec<ChangedFile> = files.into_iter().map(ChangedFile::new).collect();

    let report = resolver.resolve_all(&changed).await;
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    if report.associations.is_empty() {
        println!("No related tests found.");
        return Ok(());
    }
    for association in &report.associations {
        println!("{association}");
    }
    Ok(())
}
