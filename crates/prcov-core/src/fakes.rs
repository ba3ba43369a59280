//! In-memory fakes for the hosting-API traits (testing only)
//!
//! Both fakes count calls so tests can assert that a run made no API calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::changeset::ChangeSetProvider;
use crate::config::PullRequestRef;
use crate::error::{PrcovError, Result};
use crate::reporting::{FollowUpPullRequest, ReportSink};

// ---------------------------------------------------------------------------
// StaticChangeSet
// ---------------------------------------------------------------------------

/// Returns a fixed list of paths, or a fixed error.
#[derive(Debug)]
pub struct StaticChangeSet {
    files: Vec<String>,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl StaticChangeSet {
    pub fn new<I, S>(files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(detail: impl Into<String>) -> Self {
        Self {
            files: Vec::new(),
            failure: Some(detail.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSetProvider for StaticChangeSet {
    async fn list_changed_files(&self, _pr: &PullRequestRef) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(detail) => Err(PrcovError::collaborator("list changed files", detail)),
            None => Ok(self.files.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Records comments and opened pull requests.
#[derive(Debug)]
pub struct RecordingSink {
    head_branch: String,
    fail_comments: bool,
    fail_open: bool,
    comments: Mutex<Vec<String>>,
    opened: Mutex<Vec<FollowUpPullRequest>>,
    calls: AtomicUsize,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new("feature")
    }
}

impl RecordingSink {
    pub fn new(head_branch: impl Into<String>) -> Self {
        Self {
            head_branch: head_branch.into(),
            fail_comments: false,
            fail_open: false,
            comments: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Every `post_comment` call fails.
    pub fn failing_comments(mut self) -> Self {
        self.fail_comments = true;
        self
    }

    /// Every `open_pull_request` call fails.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn comments(&self) -> Vec<String> {
        self.comments.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<FollowUpPullRequest> {
        self.opened.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn post_comment(&self, _pr: &PullRequestRef, body: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_comments {
            return Err(PrcovError::collaborator("post comment", "sink unavailable"));
        }
        self.comments.lock().unwrap().push(body.to_string());
        Ok(())
    }

    async fn head_branch(&self, _pr: &PullRequestRef) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.head_branch.clone())
    }

    async fn open_pull_request(
        &self,
        pr: &PullRequestRef,
        request: &FollowUpPullRequest,
    ) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(PrcovError::collaborator("open pull request", "branch not pushed"));
        }
        let mut opened = self.opened.lock().unwrap();
        opened.push(request.clone());
        Ok(Some(format!(
            "https://example.invalid/{}/{}/pull/{}",
            pr.owner,
            pr.repo,
            pr.number + opened.len() as u64
        )))
    }
}
