//! prcov core - change-to-test resolution and coverage reporting
//!
//! Provides the pieces of a prcov run that do not spawn the coverage agent:
//! - Configuration and run context (`config`)
//! - Change set normalization (`changeset`)
//! - Test resolution strategies (`resolver`)
//! - Coverage aggregation and the PR summary (`coverage`)
//! - Hosting-API contracts (`changeset::ChangeSetProvider`, `reporting::ReportSink`)

pub mod changeset;
pub mod config;
pub mod coverage;
pub mod domain;
pub mod error;
pub mod fakes;
pub mod reporting;
pub mod resolver;
pub mod telemetry;

pub use changeset::{collect_change_set, normalize_changed_files, ChangeSetProvider};
pub use config::{
    AgentSettings, Inputs, PullRequestRef, ReportScope, RunConfig, RunContext, Secret,
};
pub use coverage::{
    aggregate, summarize, CoverageDelta, CoverageSummary, FailureEntry, ReportSnapshot,
};
pub use domain::{ChangedFile, OutcomeStatus, TestAssociation, WorkOutcome};
pub use error::{PrcovError, Result, NOT_PULL_REQUEST_MESSAGE};
pub use reporting::{FollowUpPullRequest, ReportSink};
pub use resolver::{is_test_file, Resolution, ResolutionReport, ResolverStrategy, TestResolver};
pub use telemetry::init_tracing;
