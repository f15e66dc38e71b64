use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use super::builtin::{FileContains, FileExists, HttpContains, HttpStatus};
use super::{Check, CheckContext, CheckOutcome};
use crate::store::models::CheckStatus;

/// Name → check lookup, filled once at process start.
///
/// Names missing from the registry go to the remote check service when one
/// is configured, and are recorded as `error` otherwise.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn Check>>,
    remote: Option<RemoteChecks>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `file_exists`, `file_contains`, `http_status` and
    /// `http_contains`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("file_exists", FileExists);
        registry.register("file_contains", FileContains);
        registry.register("http_status", HttpStatus);
        registry.register("http_contains", HttpContains);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, check: impl Check + 'static) {
        self.checks.insert(name.into(), Arc::new(check));
    }

    pub fn with_remote(mut self, base_url: impl Into<String>) -> Self {
        self.remote = Some(RemoteChecks {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    /// Run one check. Never fails: every problem becomes an outcome.
    pub async fn run(&self, name: &str, ctx: &CheckContext, args: &Value) -> CheckOutcome {
        match self.checks.get(name) {
            Some(check) => check.validate(ctx, args).await.into(),
            None => match &self.remote {
                Some(remote) => remote.run(name, ctx, args).await,
                None => CheckOutcome::error(format!("Unknown check {}", name)),
            },
        }
    }
}

/// Check service reached over HTTP: `POST {base_url}/{name}` with
/// `{context, arguments}`, answering `{status, message}`.
#[derive(Clone)]
struct RemoteChecks {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RemoteAnswer {
    status: CheckStatus,
    #[serde(default)]
    message: Option<String>,
}

impl RemoteChecks {
    async fn run(&self, name: &str, ctx: &CheckContext, args: &Value) -> CheckOutcome {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), name);
        let body = json!({"context": ctx, "arguments": args});
        let response = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return CheckOutcome::error(format!("Remote check {} failed: {}", name, e)),
        };
        if !response.status().is_success() {
            return CheckOutcome::error(format!(
                "Remote check {} returned {}",
                name,
                response.status()
            ));
        }
        match response.json::<RemoteAnswer>().await {
            Ok(answer) => CheckOutcome {
                status: answer.status,
                message: answer.message,
            },
            Err(e) => CheckOutcome::error(format!("Remote check {} sent a malformed answer: {}", name, e)),
        }
    }
}
