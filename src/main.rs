use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use capstone::config::CapstoneConfig;
use capstone::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "capstone")]
#[command(version, about = "Provision learner repos, deploy their pushes and track task progress")]
pub struct Cli {
    /// Config file (defaults to $CAPSTONE_CONFIG, then capstone.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook dispatcher and JSON API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Process queued pipeline jobs
    Worker {
        /// Drain the pending jobs once and exit
        #[arg(long)]
        once: bool,
    },
    /// Create the database and its tables
    InitDb,
    /// Evaluate a learner's checks (runs inside the checker sandbox)
    RunChecks {
        #[arg(long)]
        capstone_url: String,

        #[arg(long)]
        capstone_token: String,

        #[arg(long)]
        project_name: String,

        #[arg(long)]
        username: String,

        /// Result file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,

        /// Service consulted for checks missing from the builtin registry
        #[arg(long)]
        remote_checks_url: Option<String>,
    },
    /// Manage sites
    Site {
        #[command(subcommand)]
        command: SiteCommands,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Manage learner projects
    UserProject {
        #[command(subcommand)]
        command: UserProjectCommands,
    },
    /// Show or validate the resolved configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SiteCommands {
    Create { name: String, domain: String },
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    Create {
        #[arg(long)]
        site: String,
        username: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, default_value = "")]
        full_name: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Create a project and its content repo
    Create {
        #[arg(long)]
        site: String,
        name: String,
        #[arg(long)]
        title: Option<String>,
        /// nomad or custom; the configured default when omitted
        #[arg(long)]
        deployer: Option<String>,
    },
    /// Queue a re-read of the project's capstone.yml
    Sync {
        #[arg(long)]
        site: String,
        name: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum UserProjectCommands {
    Start {
        #[arg(long)]
        site: String,
        username: String,
        project: String,
    },
    Delete {
        #[arg(long)]
        site: String,
        username: String,
        project: String,
    },
    History {
        #[arg(long)]
        site: String,
        username: String,
        project: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show,
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CapstoneConfig::resolve(cli.config.as_deref())?;
    let log_dir = (!config.logging.dir.is_empty()).then(|| PathBuf::from(&config.logging.dir));
    let _log_guard = logging::init_logging(config.logging.format, log_dir.as_deref(), cli.verbose);

    match cli.command {
        Commands::Serve { port, db_path } => {
            cmd::cmd_serve(config.with_cli_args(port, db_path)).await?;
        }
        Commands::Worker { once } => {
            cmd::cmd_worker(config, once).await?;
        }
        Commands::InitDb => {
            cmd::cmd_init_db(&config)?;
        }
        Commands::RunChecks {
            capstone_url,
            capstone_token,
            project_name,
            username,
            output,
            remote_checks_url,
        } => {
            let args = capstone::checker::RunChecksArgs {
                capstone_url,
                capstone_token,
                project_name,
                username,
            };
            cmd::cmd_run_checks(args, output.as_deref(), remote_checks_url).await?;
        }
        Commands::Site { command } => cmd::cmd_site(&config, command)?,
        Commands::User { command } => cmd::cmd_user(&config, command)?,
        Commands::Project { command } => cmd::cmd_project(config, command).await?,
        Commands::UserProject { command } => cmd::cmd_user_project(config, command).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
