//! Configuration view and validation commands (`agent-factory config`).

use anyhow::{Context, Result};

use super::load_config;
use crate::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli.config_path();
    let config = load_config(cli)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Factory Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("Config file: {} (not found, using defaults)", config_path.display());
            }
            println!();
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render configuration")?
            );

            let options = config.engine_options()?;
            println!();
            println!("Effective:");
            println!("  llm command = \"{}\"", config.llm_command());
            match options.retry_policy.delay_override {
                Some(delay) => println!("  retry delay override = {}ms", delay.as_millis()),
                None => println!("  retry delay override = none"),
            }
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}
