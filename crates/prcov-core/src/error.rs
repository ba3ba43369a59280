//! Error taxonomy for a prcov run.

/// Message used when the run is not triggered from a pull request.
pub const NOT_PULL_REQUEST_MESSAGE: &str =
    "This action can only be run in the context of a pull request.";

/// Errors that abort a run.
///
/// Resolution, work-item and aggregation failures never surface here; they are
/// recorded as warnings or outcomes instead.
#[derive(Debug, thiserror::Error)]
pub enum PrcovError {
    #[error("{NOT_PULL_REQUEST_MESSAGE} (ref: {git_ref:?})")]
    NotPullRequest { git_ref: String },

    #[error("No {what} provided (input: {input})")]
    MissingInput { what: String, input: String },

    #[error("invalid value for input {input}: {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("{step} failed: {detail}")]
    Collaborator { step: String, detail: String },

    #[error("run aborted before {stage}")]
    Aborted { stage: String },
}

impl PrcovError {
    /// Build a collaborator failure for the named pipeline step.
    pub fn collaborator(step: impl Into<String>, detail: impl ToString) -> Self {
        Self::Collaborator {
            step: step.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether this error was raised before any external call was made.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            PrcovError::NotPullRequest { .. }
                | PrcovError::MissingInput { .. }
                | PrcovError::InvalidInput { .. }
        )
    }
}

/// Result type for prcov operations.
pub type Result<T> = std::result::Result<T, PrcovError>;
