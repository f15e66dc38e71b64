//! Layered configuration for the Capstone orchestrator.
//!
//! Settings are resolved file → environment → CLI. The file is TOML and every
//! section is optional; missing keys fall back to the defaults below.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! public_url = "https://capstone.example.com"
//! api_token = "s3cret"
//! default_site = "localhost"
//!
//! [database]
//! path = "data/capstone.db"
//!
//! [queue]
//! dir = "data/tasks"
//! poll_interval_secs = 1
//!
//! [repo_provider]
//! base_url = "http://gitto.internal:7070"
//! api_token = "gitto-token"
//!
//! [deploy]
//! default = "nomad"
//!
//! [deploy.nomad]
//! addr = "http://127.0.0.1:4646"
//! registry = "registry.internal:5000"
//! app_url_hostname_template = "{username}-{project_name}.{site_name}.apps.local"
//!
//! [deploy.custom]
//! base_url = "http://deployer.internal"
//! api_token = "deployer-token"
//!
//! [checker]
//! mode = "container"
//! image = "capstone-checker:latest"
//!
//! [logging]
//! format = "json"
//! dir = "logs"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;
use crate::store::models::DeployerKind;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "CAPSTONE_CONFIG";
/// Config file used when neither `--config` nor `CAPSTONE_CONFIG` is given.
pub const DEFAULT_CONFIG_FILE: &str = "capstone.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapstoneConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub repo_provider: RepoProviderSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub checker: CheckerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL. Webhook URLs handed to the repo
    /// provider and the URL given to the checker are built from it.
    pub public_url: String,
    /// Bearer token guarding the JSON API.
    pub api_token: String,
    /// Site used when the request Host header matches no site domain.
    pub default_site: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            api_token: String::new(),
            default_site: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/capstone.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub dir: PathBuf,
    pub poll_interval_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/tasks"),
            poll_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoProviderSection {
    pub base_url: String,
    pub api_token: String,
}

impl Default for RepoProviderSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7070".to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySection {
    /// Backend used for projects that don't pick one explicitly.
    pub default: DeployerKind,
    pub nomad: NomadSection,
    pub custom: CustomDeploySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NomadSection {
    pub addr: String,
    pub token: String,
    pub registry: String,
    pub health_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub app_url_scheme: String,
    /// Hostname template; `{username}`, `{project_name}` and `{site_name}`
    /// are substituted.
    pub app_url_hostname_template: String,
    /// Zero leaves the port out of the app URL.
    pub app_url_port: u16,
}

impl Default for NomadSection {
    fn default() -> Self {
        Self {
            addr: "http://127.0.0.1:4646".to_string(),
            token: String::new(),
            registry: "localhost:5000".to_string(),
            health_timeout_secs: 60,
            health_interval_secs: 5,
            app_url_scheme: "http".to_string(),
            app_url_hostname_template: "{username}-{project_name}.{site_name}.local".to_string(),
            app_url_port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomDeploySection {
    pub base_url: String,
    pub api_token: String,
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
}

impl Default for CustomDeploySection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            api_token: String::new(),
            poll_attempts: 100,
            poll_interval_secs: 1,
        }
    }
}

/// How the checker process is isolated from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerMode {
    /// Throwaway container with the output directory mounted (production).
    #[default]
    Container,
    /// Direct child process (development).
    Process,
}

impl FromStr for CheckerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(Self::Container),
            "process" => Ok(Self::Process),
            _ => Err(format!("Invalid checker mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerSection {
    pub mode: CheckerMode,
    pub image: String,
    /// Executable used in process mode. Empty means the running binary.
    pub program: String,
    /// Optional service that evaluates checks missing from the local registry.
    pub remote_checks_url: String,
}

impl Default for CheckerSection {
    fn default() -> Self {
        Self {
            mode: CheckerMode::Container,
            image: "capstone-checker:latest".to_string(),
            program: String::new(),
            remote_checks_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Directory for daily-rolling log files. Empty disables file output.
    pub dir: String,
}

impl CapstoneConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse capstone.toml")
    }

    /// Load from `path`, or return defaults when the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the full layered configuration: `.env`, then the file, then
    /// process environment overrides.
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let path = match explicit_path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };
        let mut config = Self::load_or_default(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`, so tests can feed a map
    /// instead of mutating the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key) {
                *target = v;
            }
        };
        set(&mut self.server.api_token, "CAPSTONE_API_TOKEN");
        set(&mut self.server.public_url, "CAPSTONE_PUBLIC_URL");
        set(&mut self.repo_provider.base_url, "GITTO_BASE_URL");
        set(&mut self.repo_provider.api_token, "GITTO_API_TOKEN");
        set(&mut self.deploy.nomad.addr, "NOMAD_ADDR");
        set(&mut self.deploy.nomad.token, "NOMAD_TOKEN");
        set(&mut self.deploy.nomad.registry, "DOCKER_REGISTRY");
        set(&mut self.deploy.custom.base_url, "CUSTOM_DEPLOYER_URL");
        set(&mut self.deploy.custom.api_token, "CUSTOM_DEPLOYER_TOKEN");
        set(&mut self.checker.image, "CHECKER_IMAGE");

        if let Some(path) = lookup("CAPSTONE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("CAPSTONE_TASKS_DIR") {
            self.queue.dir = PathBuf::from(dir);
        }
        if let Some(dev) = lookup("CAPSTONE_DEV")
            && is_truthy(&dev)
        {
            self.checker.mode = CheckerMode::Process;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = LogFormat::from_str(&format)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Invalid LOG_FORMAT")?;
        }
        Ok(())
    }

    /// Apply CLI flag overrides (the last layer).
    pub fn with_cli_args(mut self, port: Option<u16>, db_path: Option<PathBuf>) -> Self {
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(path) = db_path {
            self.database.path = path;
        }
        self
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.server.api_token.is_empty() {
            warnings.push("server.api_token is empty; the JSON API rejects every request".to_string());
        }
        if self.repo_provider.api_token.is_empty() {
            warnings.push("repo_provider.api_token is empty".to_string());
        }
        if self.deploy.nomad.health_interval_secs == 0 {
            warnings.push("deploy.nomad.health_interval_secs is 0; health polling will spin".to_string());
        }
        if self.deploy.default == DeployerKind::Custom && self.deploy.custom.api_token.is_empty() {
            warnings.push("deploy.default is custom but deploy.custom.api_token is empty".to_string());
        }
        warnings
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
