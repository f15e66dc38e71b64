//! `capstone run-checks`: the checker entry point inside the sandbox.

use std::path::Path;

use anyhow::{Context, Result};
use capstone::checker::runner::write_output;
use capstone::checker::{CheckRegistry, RunChecksArgs, run_checks};

/// Always succeeds once the result is written; a broken run is reported in
/// the result itself.
pub async fn cmd_run_checks(
    args: RunChecksArgs,
    output: Option<&Path>,
    remote_checks_url: Option<String>,
) -> Result<()> {
    let mut registry = CheckRegistry::with_builtins();
    if let Some(url) = remote_checks_url.filter(|u| !u.is_empty()) {
        registry = registry.with_remote(url);
    }
    let result = run_checks(&args, &registry).await;
    match output {
        Some(path) => write_output(path, &result)?,
        None => {
            let json =
                serde_json::to_string_pretty(&result).context("Failed to serialize checker output")?;
            println!("{}", json);
        }
    }
    Ok(())
}
