//! Workflow graph commands (`agent-factory workflow`).

use std::path::Path;

use anyhow::{Context, Result};

use agent_factory::dag::GraphCompiler;
use agent_factory::factory::models::{Node, WorkflowGraph};

use super::{load_config, open_db};
use crate::{Cli, WorkflowCommands};

pub async fn cmd_workflow(cli: &Cli, command: WorkflowCommands) -> Result<()> {
    let compiler = GraphCompiler::with_required_roles(load_config(cli)?.required_roles()?);

    match command {
        WorkflowCommands::Validate { file } => {
            let graph = read_graph(&file)?;
            let order = compiler
                .compile_graph(&graph)
                .with_context(|| format!("{} is not a valid workflow", file.display()))?;
            println!("Workflow is valid. Execution order:");
            print_order(&order);
        }
        WorkflowCommands::Set { project_id, file } => {
            let graph = read_graph(&file)?;
            let order = compiler
                .compile_graph(&graph)
                .with_context(|| format!("{} is not a valid workflow", file.display()))?;

            let db = open_db(cli)?;
            let saved = db
                .call(move |db| {
                    if db.get_project(project_id)?.is_none() {
                        return Ok(None);
                    }
                    db.save_workflow(project_id, &graph).map(Some)
                })
                .await?;
            if saved.is_none() {
                anyhow::bail!("Project {} not found", project_id);
            }
            println!("Workflow saved for project {}. Execution order:", project_id);
            print_order(&order);
        }
        WorkflowCommands::Show { project_id } => {
            let db = open_db(cli)?;
            let Some(workflow) = db.call(move |db| db.get_workflow(project_id)).await? else {
                anyhow::bail!("No workflow defined for project {}", project_id);
            };
            println!(
                "Workflow for project {} (updated {}):",
                project_id, workflow.updated_at
            );
            match compiler.compile_graph(&workflow.graph) {
                Ok(order) => print_order(&order),
                Err(e) => {
                    println!("  warning: {}", e);
                    print_order(&workflow.graph.nodes);
                }
            }
        }
    }
    Ok(())
}

fn read_graph(path: &Path) -> Result<WorkflowGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
    WorkflowGraph::parse(&content)
}

fn print_order(nodes: &[Node]) {
    for (i, node) in nodes.iter().enumerate() {
        println!("  {}. [{}] {} ({})", i + 1, node.agent_role, node.task_name(), node.id);
    }
}
