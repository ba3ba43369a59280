//! Domain types shared across one pipeline run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A file path reported as added or modified by the pull request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: PathBuf,
}

impl ChangedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A (source file, test file) pair discovered by resolution.
///
/// The pair is the identity; either field may repeat across associations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestAssociation {
    pub source_file: PathBuf,
    pub test_file: PathBuf,
}

impl TestAssociation {
    pub fn new(source_file: impl Into<PathBuf>, test_file: impl Into<PathBuf>) -> Self {
        Self {
            source_file: source_file.into(),
            test_file: test_file.into(),
        }
    }

    /// File stem of the source, used to derive per-item report names.
    pub fn source_stem(&self) -> String {
        file_stem(&self.source_file)
    }
}

impl fmt::Display for TestAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.source_file.display(),
            self.test_file.display()
        )
    }
}

/// Terminal status of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Result of one external-agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub association: TestAssociation,
    pub status: OutcomeStatus,
    /// Process exit code; -1 when no exit code was observed.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl WorkOutcome {
    /// Classify a finished process by its exit code.
    pub fn from_exit(
        association: TestAssociation,
        exit_code: i32,
        stdout: String,
        stderr: String,
    ) -> Self {
        let status = if exit_code == 0 {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Failure
        };
        Self {
            association,
            status,
            exit_code,
            stdout,
            stderr,
        }
    }

    /// A failure that never produced an exit code (spawn error, timeout, cancellation).
    pub fn failed(association: TestAssociation, detail: impl Into<String>) -> Self {
        Self {
            association,
            status: OutcomeStatus::Failure,
            exit_code: -1,
            stdout: String::new(),
            stderr: detail.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// Base name without extension, lossily converted.
pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
