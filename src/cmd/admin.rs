//! Operator commands: database setup and tenant/project/learner management.

use anyhow::{Context, Result};
use capstone::config::CapstoneConfig;
use capstone::errors::CapstoneError;
use capstone::lifecycle::Orchestrator;
use capstone::store::CapstoneDb;
use capstone::store::models::{DeployerKind, NewProject, Project, Site, User, UserProjectContext};

use super::super::{ProjectCommands, SiteCommands, UserCommands, UserProjectCommands};

fn open_db(config: &CapstoneConfig) -> Result<CapstoneDb> {
    CapstoneDb::new(&config.database.path)
        .with_context(|| format!("Failed to open database {}", config.database.path.display()))
}

fn find_site(db: &CapstoneDb, name: &str) -> Result<Site> {
    db.get_site(name)?.ok_or_else(|| {
        CapstoneError::SiteNotFound {
            name: name.to_string(),
        }
        .into()
    })
}

fn find_user(db: &CapstoneDb, site: &Site, username: &str) -> Result<User> {
    db.get_user(site.id, username)?.ok_or_else(|| {
        CapstoneError::UserNotFound {
            username: username.to_string(),
        }
        .into()
    })
}

fn find_project(db: &CapstoneDb, site: &Site, name: &str) -> Result<Project> {
    db.get_project(site.id, name)?.ok_or_else(|| {
        CapstoneError::ProjectNotFound {
            name: name.to_string(),
        }
        .into()
    })
}

fn find_context(
    db: &CapstoneDb,
    site: &Site,
    username: &str,
    project: &str,
) -> Result<UserProjectContext> {
    db.get_user_project_context(site.id, username, project)?
        .ok_or_else(|| {
            CapstoneError::UserProjectNotFound {
                username: username.to_string(),
                project: project.to_string(),
            }
            .into()
        })
}

pub fn cmd_init_db(config: &CapstoneConfig) -> Result<()> {
    open_db(config)?;
    println!("Database initialized at {}", config.database.path.display());
    Ok(())
}

pub fn cmd_site(config: &CapstoneConfig, command: SiteCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        SiteCommands::Create { name, domain } => {
            let site = db.create_site(&name, &domain)?;
            println!("Created site {} ({})", site.name, site.domain);
        }
    }
    Ok(())
}

pub fn cmd_user(config: &CapstoneConfig, command: UserCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        UserCommands::Create {
            site,
            username,
            email,
            full_name,
        } => {
            let site = find_site(&db, &site)?;
            let user = db.create_user(site.id, &username, &email, &full_name)?;
            println!("Created user {} on {}", user.username, site.name);
        }
    }
    Ok(())
}

pub async fn cmd_project(config: CapstoneConfig, command: ProjectCommands) -> Result<()> {
    let orch = Orchestrator::from_config(config)?;
    match command {
        ProjectCommands::Create {
            site,
            name,
            title,
            deployer,
        } => {
            let deployer = deployer
                .map(|d| d.parse::<DeployerKind>().map_err(anyhow::Error::msg))
                .transpose()?;
            let site = find_site(&*orch.db.lock_sync()?, &site)?;
            let new = NewProject {
                title: title.unwrap_or_else(|| name.clone()),
                name,
                deployer,
                ..Default::default()
            };
            let project = orch.create_project(&site, &new).await?;
            println!(
                "Created project {} with repo {}",
                project.name,
                project.git_url.as_deref().unwrap_or("-")
            );
        }
        ProjectCommands::Sync { site, name } => {
            let project = {
                let db = orch.db.lock_sync()?;
                let site = find_site(&db, &site)?;
                find_project(&db, &site, &name)?
            };
            let changelog = orch.enqueue_project_update(&project).await?;
            println!("Queued sync of {} (changelog {})", project.name, changelog.id);
        }
    }
    Ok(())
}

pub async fn cmd_user_project(config: CapstoneConfig, command: UserProjectCommands) -> Result<()> {
    let orch = Orchestrator::from_config(config)?;
    match command {
        UserProjectCommands::Start {
            site,
            username,
            project,
        } => {
            let (user, project) = {
                let db = orch.db.lock_sync()?;
                let site = find_site(&db, &site)?;
                (find_user(&db, &site, &username)?, find_project(&db, &site, &project)?)
            };
            let user_project = orch.start_user_project(&user, &project).await?;
            println!(
                "Started {} for {}: {}",
                project.name, user.username, user_project.git_url
            );
        }
        UserProjectCommands::Delete {
            site,
            username,
            project,
        } => {
            let ctx = {
                let db = orch.db.lock_sync()?;
                let site = find_site(&db, &site)?;
                find_context(&db, &site, &username, &project)?
            };
            orch.delete_user_project(&ctx).await?;
            println!("Deleted {} for {}", ctx.project.name, ctx.user.username);
        }
        UserProjectCommands::History {
            site,
            username,
            project,
        } => {
            let db = orch.db.lock_sync()?;
            let site = find_site(&db, &site)?;
            let ctx = find_context(&db, &site, &username, &project)?;
            let history = db.user_project_history(ctx.user.id, ctx.project.id)?;
            if history.is_empty() {
                println!("No runs yet");
            }
            for item in history {
                println!(
                    "#{}  {}  {}",
                    item.changelog_id,
                    item.timestamp,
                    item.status.as_str()
                );
                for line in item.log.lines() {
                    println!("    {}", line);
                }
            }
        }
    }
    Ok(())
}
