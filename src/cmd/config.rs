//! Configuration view and validation for `capstone config`.

use anyhow::{Context, Result};
use capstone::config::CapstoneConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &CapstoneConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let mut shown = config.clone();
            mask(&mut shown.server.api_token);
            mask(&mut shown.repo_provider.api_token);
            mask(&mut shown.deploy.nomad.token);
            mask(&mut shown.deploy.custom.api_token);
            let toml = toml::to_string_pretty(&shown).context("Failed to render configuration")?;
            print!("{}", toml);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration OK");
            } else {
                for warning in &warnings {
                    println!("warning: {}", warning);
                }
            }
        }
    }
    Ok(())
}

fn mask(secret: &mut String) {
    if !secret.is_empty() {
        *secret = "********".to_string();
    }
}
