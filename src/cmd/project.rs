//! Project commands (`agent-factory project`).

use anyhow::Result;

use super::open_db;
use crate::{Cli, ProjectCommands};

pub async fn cmd_project(cli: &Cli, command: ProjectCommands) -> Result<()> {
    let db = open_db(cli)?;

    match command {
        ProjectCommands::Create { name, description } => {
            if name.trim().is_empty() {
                anyhow::bail!("Project name must not be empty");
            }
            let project = db
                .call(move |db| db.create_project(name.trim(), &description))
                .await?;
            println!("Created project {}: {}", project.id, project.name);
        }
        ProjectCommands::List => {
            let projects = db.call(|db| db.list_projects()).await?;
            if projects.is_empty() {
                println!("No projects yet. Create one with 'agent-factory project create <name>'.");
                return Ok(());
            }
            println!("{:<6} {:<24} {:<27} DESCRIPTION", "ID", "NAME", "CREATED");
            for project in projects {
                println!(
                    "{:<6} {:<24} {:<27} {}",
                    project.id, project.name, project.created_at, project.description
                );
            }
        }
    }
    Ok(())
}
