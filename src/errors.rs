//! Typed error hierarchy for the Capstone orchestrator.
//!
//! - `RepoProviderError`: failures talking to the Git hosting service
//! - `CapstoneError`: lifecycle failures callers branch on (not found, conflict)
//! - `CheckFailure`: the two ways a single check can fail
//! - `QueueError`: file-backed job queue failures

use thiserror::Error;

/// Errors from the repo provider client. Every non-2xx answer is `Status`.
#[derive(Debug, Error)]
pub enum RepoProviderError {
    #[error("Repo provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Repo provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Repo provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors from provisioning and lookups.
#[derive(Debug, Error)]
pub enum CapstoneError {
    #[error("Site {name} not found")]
    SiteNotFound { name: String },

    #[error("User {username} not found")]
    UserNotFound { username: String },

    #[error("Project {name} not found")]
    ProjectNotFound { name: String },

    #[error("{username} has not started project {project}")]
    UserProjectNotFound { username: String, project: String },

    #[error("Changelog {id} not found")]
    ChangelogNotFound { id: i64 },

    #[error("{username} has already started project {project}")]
    AlreadyStarted { username: String, project: String },

    #[error("Project {name} already exists")]
    AlreadyExists { name: String },

    #[error("User and project belong to different sites")]
    SiteMismatch,

    #[error("No handler registered for job {name}")]
    UnknownJob { name: String },

    #[error(transparent)]
    RepoProvider(#[from] RepoProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CapstoneError {
    /// True for the "already signed up" / "already exists" class of errors.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyStarted { .. } | Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SiteNotFound { .. }
                | Self::UserNotFound { .. }
                | Self::ProjectNotFound { .. }
                | Self::UserProjectNotFound { .. }
                | Self::ChangelogNotFound { .. }
        )
    }
}

/// Outcome of a check that did not pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckFailure {
    /// The learner's app does not meet the check. Recorded as `fail`.
    #[error("{0}")]
    Validation(String),

    /// The check itself broke. Recorded as `error`.
    #[error("{0}")]
    Unexpected(String),
}

/// Errors from the file-backed job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt job record at {path}: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_provider_status_carries_code_and_body() {
        let err = RepoProviderError::Status {
            status: 503,
            body: "maintenance".to_string(),
        };
        match &err {
            RepoProviderError::Status { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "maintenance");
            }
            _ => panic!("Expected Status variant"),
        }
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn capstone_error_converts_from_repo_provider_error() {
        let inner = RepoProviderError::InvalidResponse("missing id".to_string());
        let err: CapstoneError = inner.into();
        assert!(matches!(err, CapstoneError::RepoProvider(_)));
    }

    #[test]
    fn capstone_error_classifies_conflicts() {
        let err = CapstoneError::AlreadyStarted {
            username: "alice".to_string(),
            project: "blog".to_string(),
        };
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("already started"));
    }

    #[test]
    fn capstone_error_classifies_not_found() {
        let err = CapstoneError::ProjectNotFound {
            name: "blog".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn capstone_error_downcasts_through_anyhow() {
        let err: anyhow::Error = CapstoneError::SiteMismatch.into();
        assert!(matches!(
            err.downcast_ref::<CapstoneError>(),
            Some(CapstoneError::SiteMismatch)
        ));
    }

    #[test]
    fn check_failure_displays_message() {
        let err = CheckFailure::Validation("expected 200, got 404".to_string());
        assert_eq!(err.to_string(), "expected 200, got 404");
    }

    #[test]
    fn queue_error_corrupt_carries_path() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = QueueError::Corrupt {
            path: std::path::PathBuf::from("/q/pending/x"),
            source,
        };
        assert!(err.to_string().contains("/q/pending/x"));
    }
}
