//! GitHub REST client backing the change-set and reporting traits.

use async_trait::async_trait;
use prcov_core::{
    ChangeSetProvider, FollowUpPullRequest, PrcovError, PullRequestRef, ReportSink, Result,
    Secret,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Page size for listing pull request files (the API maximum).
const FILES_PER_PAGE: usize = 100;

/// The API stops listing files after 3000 entries.
const MAX_FILE_PAGES: usize = 30;

#[derive(Debug, Deserialize)]
struct PullFile {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct PullHead {
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestInfo {
    head: PullHead,
}

#[derive(Debug, Deserialize)]
struct Created {
    html_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommentBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct NewPullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

/// Authenticated client for one GitHub API endpoint.
pub struct GitHubClient {
    http: Client,
    api_url: String,
    token: Secret,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: Secret) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("prcov"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PrcovError::collaborator("build http client", e))?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn repo_url(&self, pr: &PullRequestRef, tail: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, pr.owner, pr.repo, tail)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        step: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        let response = request
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(|e| PrcovError::collaborator(step, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PrcovError::collaborator(step, describe_failure(status, &body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| PrcovError::collaborator(step, e))
    }
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {message}")
    }
}

#[async_trait]
impl ChangeSetProvider for GitHubClient {
    async fn list_changed_files(&self, pr: &PullRequestRef) -> Result<Vec<String>> {
        let url = self.repo_url(pr, &format!("pulls/{}/files", pr.number));
        let mut files = Vec::new();

        for page in 1..=MAX_FILE_PAGES {
            let request = self.http.get(&url).query(&[
                ("per_page", FILES_PER_PAGE.to_string()),
                ("page", page.to_string()),
            ]);
            let batch: Vec<PullFile> = self.send_json("list changed files", request).await?;
            debug!(page, count = batch.len(), "fetched pull request files");

            let last = batch.len() < FILES_PER_PAGE;
            files.extend(batch.into_iter().map(|f| f.filename));
            if last {
                break;
            }
        }

        Ok(files)
    }
}

#[async_trait]
impl ReportSink for GitHubClient {
    async fn post_comment(&self, pr: &PullRequestRef, body: &str) -> Result<()> {
        let url = self.repo_url(pr, &format!("issues/{}/comments", pr.number));
        let request = self.http.post(url).json(&CommentBody { body });
        let _: Created = self.send_json("post comment", request).await?;
        Ok(())
    }

    async fn head_branch(&self, pr: &PullRequestRef) -> Result<String> {
        let url = self.repo_url(pr, &format!("pulls/{}", pr.number));
        let info: PullRequestInfo = self
            .send_json("fetch pull request", self.http.get(url))
            .await?;
        Ok(info.head.ref_name)
    }

    async fn open_pull_request(
        &self,
        pr: &PullRequestRef,
        request: &FollowUpPullRequest,
    ) -> Result<Option<String>> {
        let url = self.repo_url(pr, "pulls");
        let body = NewPullRequest {
            title: &request.title,
            head: &request.head,
            base: &request.base,
            body: &request.body,
        };
        let created: Created = self
            .send_json("open pull request", self.http.post(url).json(&body))
            .await?;
        Ok(created.html_url)
    }
}
