//! Change set provider: the files a pull request touches.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::info;

use crate::config::PullRequestRef;
use crate::domain::ChangedFile;
use crate::error::Result;

/// Source of raw changed-file paths for a pull request.
///
/// Implement this for the hosting API; use [`crate::fakes::StaticChangeSet`] in tests.
#[async_trait]
pub trait ChangeSetProvider: Send + Sync {
    /// Raw paths as reported by the host, possibly with blanks or repeats.
    async fn list_changed_files(&self, pr: &PullRequestRef) -> Result<Vec<String>>;
}

/// Trim, drop blanks and de-duplicate by exact path, keeping first-seen order.
pub fn normalize_changed_files<I, S>(raw: I) -> Vec<ChangedFile>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|path| {
            let trimmed = path.as_ref().trim();
            if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
                None
            } else {
                Some(ChangedFile::new(trimmed))
            }
        })
        .collect()
}

/// Fetch and normalize the change set for `pr`.
pub async fn collect_change_set(
    provider: &dyn ChangeSetProvider,
    pr: &PullRequestRef,
) -> Result<Vec<ChangedFile>> {
    let raw = provider.list_changed_files(pr).await?;
    let raw_count = raw.len();
    let files = normalize_changed_files(raw);
    info!(pr = %pr, raw = raw_count, unique = files.len(), "collected changed files");
    Ok(files)
}
