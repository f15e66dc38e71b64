//! Checker: runs a project's declared checks against a learner's deployed app.
//!
//! Two halves live here:
//!
//! | Side | Module | Runs where |
//! |------|--------|------------|
//! | check execution (`capstone run-checks`) | `registry`, `builtin`, `runner` | inside the sandbox |
//! | sandbox invocation | `invoke` | in the worker |
//!
//! The sandbox writes a [`CheckerOutput`] JSON file; the worker reads it and
//! hands the task outcomes to the reconciler.

pub mod builtin;
pub mod invoke;
pub mod registry;
pub mod runner;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CheckFailure;
use crate::store::models::CheckStatus;

pub use invoke::{CheckRequest, CheckerRunner, ContainerChecker, ProcessChecker};
pub use registry::CheckRegistry;
pub use runner::{RunChecksArgs, run_checks};

/// What a check can see about the learner's work.
#[derive(Debug, Clone, Serialize)]
pub struct CheckContext {
    /// URL of the deployed app, when one is known.
    pub app_url: Option<String>,
    /// Checkout of the learner's repo.
    pub app_dir: PathBuf,
    #[serde(skip)]
    pub http: reqwest::Client,
}

impl CheckContext {
    pub fn new(app_url: Option<String>, app_dir: PathBuf) -> Self {
        Self {
            app_url,
            app_dir,
            http: reqwest::Client::new(),
        }
    }
}

/// A named verification, registered in a [`CheckRegistry`] at startup.
///
/// `Err(CheckFailure::Validation)` records `fail`; `Err(CheckFailure::Unexpected)`
/// records `error`.
#[async_trait]
pub trait Check: Send + Sync {
    async fn validate(&self, ctx: &CheckContext, args: &serde_json::Value)
    -> Result<(), CheckFailure>;
}

/// Plain functions and closures are checks too.
#[async_trait]
impl<F> Check for F
where
    F: Fn(&CheckContext, &serde_json::Value) -> Result<(), CheckFailure> + Send + Sync,
{
    async fn validate(
        &self,
        ctx: &CheckContext,
        args: &serde_json::Value,
    ) -> Result<(), CheckFailure> {
        self(ctx, args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl CheckOutcome {
    pub fn pass() -> Self {
        Self {
            status: CheckStatus::Pass,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            message: Some(message.into()),
        }
    }
}

impl From<Result<(), CheckFailure>> for CheckOutcome {
    fn from(result: Result<(), CheckFailure>) -> Self {
        match result {
            Ok(()) => Self::pass(),
            Err(CheckFailure::Validation(msg)) => Self {
                status: CheckStatus::Fail,
                message: Some(msg),
            },
            Err(CheckFailure::Unexpected(msg)) => Self::error(msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub name: String,
    pub checks: Vec<CheckOutcome>,
}

impl TaskOutcome {
    pub fn all_pass(&self) -> bool {
        self.checks.iter().all(|c| c.status == CheckStatus::Pass)
    }
}

/// Result file written by `capstone run-checks --output`.
///
/// `ok` is false only when the run itself broke (clone failed, API
/// unreachable); failing checks still give `ok: true`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckerOutput {
    pub ok: bool,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub tasks: Vec<TaskOutcome>,
}

impl CheckerOutput {
    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            ok: false,
            log: log.into(),
            tasks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_from_check_result() {
        assert_eq!(CheckOutcome::from(Ok(())).status, CheckStatus::Pass);
        let fail = CheckOutcome::from(Err(CheckFailure::Validation("no".to_string())));
        assert_eq!(fail.status, CheckStatus::Fail);
        assert_eq!(fail.message.as_deref(), Some("no"));
        let error = CheckOutcome::from(Err(CheckFailure::Unexpected("boom".to_string())));
        assert_eq!(error.status, CheckStatus::Error);
    }

    #[test]
    fn test_checker_output_schema() {
        let output: CheckerOutput = serde_json::from_value(json!({
            "ok": true,
            "log": "",
            "tasks": [{"name": "t1", "checks": [{"status": "fail", "message": "nope"}]}]
        }))
        .unwrap();
        assert!(output.ok);
        assert_eq!(output.tasks[0].checks[0].status, CheckStatus::Fail);
        assert!(!output.tasks[0].all_pass());
    }

    #[tokio::test]
    async fn test_closure_is_a_check() {
        let check = |_: &CheckContext, args: &serde_json::Value| {
            if args["ok"] == true {
                Ok(())
            } else {
                Err(CheckFailure::Validation("not ok".to_string()))
            }
        };
        let ctx = CheckContext::new(None, PathBuf::from("."));
        assert!(check.validate(&ctx, &json!({"ok": true})).await.is_ok());
        assert!(check.validate(&ctx, &json!({})).await.is_err());
    }
}
