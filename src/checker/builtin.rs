//! Checks available to every project without extra setup.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{Check, CheckContext};
use crate::errors::CheckFailure;

/// `file_exists {path}`: a file exists in the learner's repo.
pub struct FileExists;

/// `file_contains {path, text}`: a repo file contains `text`.
pub struct FileContains;

/// `http_status {path = "/", status = 200}`: the app answers with `status`.
pub struct HttpStatus;

/// `http_contains {path = "/", text}`: the app's response body contains `text`.
pub struct HttpContains;

#[async_trait]
impl Check for FileExists {
    async fn validate(&self, ctx: &CheckContext, args: &Value) -> Result<(), CheckFailure> {
        let rel = str_arg(args, "path")?;
        let path = repo_path(&ctx.app_dir, rel)?;
        if path.is_file() {
            Ok(())
        } else {
            Err(CheckFailure::Validation(format!("File {} not found", rel)))
        }
    }
}

#[async_trait]
impl Check for FileContains {
    async fn validate(&self, ctx: &CheckContext, args: &Value) -> Result<(), CheckFailure> {
        let rel = str_arg(args, "path")?;
        let text = str_arg(args, "text")?;
        let path = repo_path(&ctx.app_dir, rel)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| CheckFailure::Validation(format!("File {} not found", rel)))?;
        if content.contains(text) {
            Ok(())
        } else {
            Err(CheckFailure::Validation(format!(
                "File {} does not contain {:?}",
                rel, text
            )))
        }
    }
}

#[async_trait]
impl Check for HttpStatus {
    async fn validate(&self, ctx: &CheckContext, args: &Value) -> Result<(), CheckFailure> {
        let expected = match args.get("status") {
            None | Some(Value::Null) => 200,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| CheckFailure::Unexpected("Argument status must be a number".to_string()))?,
        };
        let (url, response) = get(ctx, args).await?;
        let status = u64::from(response.status().as_u16());
        if status == expected {
            Ok(())
        } else {
            Err(CheckFailure::Validation(format!(
                "Expected status {} from {}, got {}",
                expected, url, status
            )))
        }
    }
}

#[async_trait]
impl Check for HttpContains {
    async fn validate(&self, ctx: &CheckContext, args: &Value) -> Result<(), CheckFailure> {
        let text = str_arg(args, "text")?;
        let (url, response) = get(ctx, args).await?;
        let body = response
            .text()
            .await
            .map_err(|e| CheckFailure::Validation(format!("Could not read response from {}: {}", url, e)))?;
        if body.contains(text) {
            Ok(())
        } else {
            Err(CheckFailure::Validation(format!(
                "Response from {} does not contain {:?}",
                url, text
            )))
        }
    }
}

async fn get(ctx: &CheckContext, args: &Value) -> Result<(String, reqwest::Response), CheckFailure> {
    let base = ctx
        .app_url
        .as_deref()
        .ok_or_else(|| CheckFailure::Unexpected("The app has not been deployed".to_string()))?;
    let path = args.get("path").and_then(Value::as_str).unwrap_or("/");
    let url = join_url(base, path);
    let response = ctx
        .http
        .get(&url)
        .send()
        .await
        .map_err(|e| CheckFailure::Validation(format!("Could not reach {}: {}", url, e)))?;
    Ok((url, response))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, CheckFailure> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CheckFailure::Unexpected(format!("Missing string argument {}", key)))
}

/// Resolve `rel` inside `root`, refusing absolute paths and `..`.
fn repo_path(root: &Path, rel: &str) -> Result<PathBuf, CheckFailure> {
    let rel_path = Path::new(rel);
    if rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(CheckFailure::Unexpected(format!(
            "Path {} must stay inside the repository",
            rel
        )));
    }
    Ok(root.join(rel_path))
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
