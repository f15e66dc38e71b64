//! Tracing setup and span helpers.
//!
//! Operators read these logs. The text a learner sees about a deployment is
//! the cumulative stage log stored in the changelog, not this output.

use std::path::Path;
use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call more than once; later calls are no-ops and return `None`.
/// When `log_dir` is given, a daily-rolling JSON file is written there too
/// and the returned guard must be held until shutdown so buffered lines are
/// flushed.
///
/// `RUST_LOG` controls levels (default `info`, or `debug` when `verbose`).
/// Console output goes to stderr so command output on stdout stays clean.
pub fn init_logging(format: LogFormat, log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let mut guard = None;
    INIT.call_once(|| {
        let default_level = if verbose { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let (file_layer, file_guard) = match log_dir {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "capstone.log");
                let (writer, g) = tracing_appender::non_blocking(appender);
                (
                    Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                    Some(g),
                )
            }
            None => (None, None),
        };
        guard = file_guard;

        // try_init: a test harness may already have installed a subscriber.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init(),
        };
    });
    guard
}

/// Span for one background job execution.
#[must_use]
pub fn job_span(job: &str, key: &str) -> Span {
    tracing::info_span!("job", job = job, key = key)
}

/// Span for a deployment of one learner's project.
#[must_use]
pub fn deploy_span(deployer: &str, username: &str, project: &str) -> Span {
    tracing::info_span!(
        "deploy",
        deployer = deployer,
        username = username,
        project = project,
    )
}

/// Span for a provisioning operation. `owner` is the learner for user
/// projects and the site for projects.
#[must_use]
pub fn provision_span(operation: &str, owner: &str, project: &str) -> Span {
    tracing::info_span!("provision", op = operation, owner = owner, project = project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_is_noop() {
        let _ = init_logging(LogFormat::Pretty, None, false);
        assert!(init_logging(LogFormat::Json, None, true).is_none());
    }

    #[test]
    fn test_spans_enter() {
        let span = job_span("update_user_project", "update_user_project-1");
        let _guard = span.enter();
        tracing::info!("inside job span");
        let span = deploy_span("nomad", "alice", "blog");
        let _guard = span.enter();
        tracing::info!("inside deploy span");
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
