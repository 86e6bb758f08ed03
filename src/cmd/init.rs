//! Factory initialisation command (`agent-factory init`).

use anyhow::{Context, Result};

use agent_factory::factory_config::FactoryToml;

use super::open_db;
use crate::Cli;

pub fn cmd_init(cli: &Cli) -> Result<()> {
    let db_path = cli.db_path();
    open_db(cli)?;
    println!("Factory database initialized at {}", db_path.display());

    let config_path = cli.config_path();
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        FactoryToml::default().save(&config_path)?;
        println!("Default config written to {}", config_path.display());
    }
    Ok(())
}
