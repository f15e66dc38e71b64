use std::fmt::Write as _;
use std::path::Path;
use std::process::Stdio;

/// Cumulative, human-readable log of a deployment.
///
/// Each command is echoed as `$ program args` followed by its combined
/// output. This text ends up in the changelog, so it is what a learner sees
/// when a deploy fails.
#[derive(Debug, Default, Clone)]
pub struct CommandLog {
    text: String,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, line: impl AsRef<str>) {
        self.text.push_str(line.as_ref());
        if !self.text.ends_with('\n') {
            self.text.push('\n');
        }
    }

    /// Record a stage failure.
    pub fn fail(&mut self, stage: &str, detail: impl std::fmt::Display) {
        let _ = writeln!(self.text, "{}\n{}", stage, detail);
    }

    /// Run a command and append its output. Returns true on zero exit; a
    /// spawn failure counts as a failed command.
    pub async fn run(&mut self, program: &str, args: &[&str], cwd: Option<&Path>) -> bool {
        let _ = writeln!(self.text, "$ {} {}", program, args.join(" "));
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        match cmd.output().await {
            Ok(output) => {
                self.text.push_str(&String::from_utf8_lossy(&output.stdout));
                self.text.push_str(&String::from_utf8_lossy(&output.stderr));
                if !output.status.success() {
                    let _ = writeln!(self.text, "[exit status: {}]", output.status);
                }
                output.status.success()
            }
            Err(e) => {
                let _ = writeln!(self.text, "Failed to run {}: {}", program, e);
                false
            }
        }
    }

    /// Like `run`, but returns trimmed stdout on success.
    pub async fn capture(&mut self, program: &str, args: &[&str], cwd: Option<&Path>) -> Option<String> {
        let _ = writeln!(self.text, "$ {} {}", program, args.join(" "));
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        match cmd.output().await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                self.line(&stdout);
                Some(stdout)
            }
            Ok(output) => {
                self.text.push_str(&String::from_utf8_lossy(&output.stderr));
                let _ = writeln!(self.text, "[exit status: {}]", output.status);
                None
            }
            Err(e) => {
                let _ = writeln!(self.text, "Failed to run {}: {}", program, e);
                None
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}
