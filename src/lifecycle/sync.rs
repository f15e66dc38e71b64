//! Project metadata sync from the project repo's `capstone.yml`.
//!
//! ```yaml
//! deployer: nomad            # optional
//! tasks:
//!   - name: homepage
//!     title: Add a homepage
//!     description: Serve a page at /.
//!     checks:
//!       - http_status                       # bare name
//!       - http_contains: {text: Welcome}    # name → arguments
//!       - name: file_exists                 # full form
//!         title: README is present
//!         args: {path: README.md}
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use super::Orchestrator;
use crate::git;
use crate::store::models::{DeployerKind, NewCheck, NewTask, Project, Task};

pub const METADATA_FILE: &str = "capstone.yml";

#[derive(Debug, Deserialize)]
pub struct ProjectMetadata {
    #[serde(default)]
    pub deployer: Option<DeployerKind>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CheckSpec {
    Name(String),
    Full(NewCheck),
    WithArgs(BTreeMap<String, Value>),
}

impl CheckSpec {
    fn into_check(self) -> Result<NewCheck> {
        match self {
            Self::Name(name) => Ok(NewCheck {
                name,
                title: String::new(),
                args: Value::Object(Default::default()),
            }),
            Self::Full(check) => Ok(check),
            Self::WithArgs(map) => {
                if map.len() != 1 {
                    bail!("A check must be a name, a single name: arguments pair, or have a name field");
                }
                let Some((name, args)) = map.into_iter().next() else {
                    bail!("Empty check entry");
                };
                let args = match args {
                    Value::Null => Value::Object(Default::default()),
                    other => other,
                };
                Ok(NewCheck {
                    name,
                    title: String::new(),
                    args,
                })
            }
        }
    }
}

impl ProjectMetadata {
    pub fn into_tasks(self) -> Result<Vec<NewTask>> {
        self.tasks
            .into_iter()
            .map(|task| {
                let checks = task
                    .checks
                    .into_iter()
                    .map(CheckSpec::into_check)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Invalid checks in task {}", task.name))?;
                Ok(NewTask {
                    name: task.name,
                    title: task.title,
                    description: task.description,
                    checks,
                })
            })
            .collect()
    }
}

pub fn parse_metadata(content: &str) -> Result<ProjectMetadata> {
    serde_yaml::from_str(content).with_context(|| format!("Failed to parse {}", METADATA_FILE))
}

pub fn load_metadata(dir: &Path) -> Result<ProjectMetadata> {
    let path = dir.join(METADATA_FILE);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_metadata(&content)
}

impl Orchestrator {
    /// Pull the project repo and apply its task list. Returns the tasks now
    /// stored and appends a summary to `log`.
    pub async fn sync_project(&self, project: &Project, log: &mut String) -> Result<Vec<Task>> {
        let url = project
            .git_url
            .as_deref()
            .with_context(|| format!("Project {} has no repo", project.name))?;
        let work = tempfile::tempdir().context("Failed to create sync directory")?;
        let checkout = work.path().join("project");
        git::clone(url, &checkout).await?;
        let commit = git::head_commit(&checkout).await?;
        let _ = writeln!(log, "Synced {} at {}", project.name, commit);

        let metadata = load_metadata(&checkout)?;
        let deployer = metadata.deployer;
        let tasks = metadata.into_tasks()?;

        let project_id = project.id;
        let stored = self
            .db
            .call(move |db| {
                let stored = db.update_tasks(project_id, &tasks)?;
                if deployer.is_some() {
                    db.set_project_deployer(project_id, deployer)?;
                }
                Ok(stored)
            })
            .await?;
        for task in &stored {
            let _ = writeln!(log, "{}. {} ({})", task.position + 1, task.title, task.name);
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_all_check_forms() {
        let metadata = parse_metadata(
            r#"
deployer: custom
tasks:
  - name: homepage
    title: Add a homepage
    checks:
      - http_status
      - http_contains: {text: Welcome}
      - name: file_exists
        title: README is present
        args: {path: README.md}
  - name: empty
"#,
        )
        .unwrap();
        assert_eq!(metadata.deployer, Some(DeployerKind::Custom));
        let tasks = metadata.into_tasks().unwrap();
        assert_eq!(tasks.len(), 2);
        let checks = &tasks[0].checks;
        assert_eq!(checks[0].name, "http_status");
        assert_eq!(checks[0].args, json!({}));
        assert_eq!(checks[1].name, "http_contains");
        assert_eq!(checks[1].args, json!({"text": "Welcome"}));
        assert_eq!(checks[2].title, "README is present");
        assert_eq!(checks[2].args, json!({"path": "README.md"}));
        assert!(tasks[1].checks.is_empty());
    }

    #[test]
    fn test_ambiguous_check_entry_is_rejected() {
        let metadata = parse_metadata(
            r#"
tasks:
  - name: t
    checks:
      - {a: {}, b: {}}
"#,
        )
        .unwrap();
        let err = metadata.into_tasks().unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid checks in task t"));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(parse_metadata("tasks: [").is_err());
        assert!(parse_metadata("tasks:\n  - title: no name\n").is_err());
    }
}
