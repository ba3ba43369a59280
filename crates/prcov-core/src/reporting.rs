//! Reporting sink: publish results back to the pull request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PullRequestRef;
use crate::error::Result;

/// Suffix appended to the head branch for the follow-up pull request.
pub const FOLLOW_UP_BRANCH_SUFFIX: &str = "-test";

/// Outbound side of the hosting API.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Post `body` as a comment on the pull request.
    async fn post_comment(&self, pr: &PullRequestRef, body: &str) -> Result<()>;

    /// Name of the pull request's head branch.
    async fn head_branch(&self, pr: &PullRequestRef) -> Result<String>;

    /// Open a new pull request; returns its URL when the host reports one.
    async fn open_pull_request(
        &self,
        pr: &PullRequestRef,
        request: &FollowUpPullRequest,
    ) -> Result<Option<String>>;
}

/// The pull request carrying generated tests back to the author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUpPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

impl FollowUpPullRequest {
    /// Derive the follow-up for a PR whose head branch is `original`.
    pub fn for_branch(original: &str, base: &str) -> Self {
        Self {
            head: format!("{original}{FOLLOW_UP_BRANCH_SUFFIX}"),
            base: base.to_string(),
            title: format!("Test Coverage for {original}"),
            body: format!(
                "This PR is created for testing purposes based on the previous branch: {original}."
            ),
        }
    }
}
