//! Run commands (`agent-factory run`).

use anyhow::Result;

use agent_factory::factory::ResumeOutcome;

use super::{follow_events, open_engine, print_run, print_tasks, recover_stale_runs, wait_and_report};
use crate::{Cli, RunCommands};

pub async fn cmd_run(cli: &Cli, command: RunCommands) -> Result<()> {
    let engine = open_engine(cli).await?;

    match command {
        RunCommands::Start {
            project_id,
            timeout,
        } => {
            recover_stale_runs(&engine).await?;
            let follower = follow_events(&engine.sink);
            let run = match engine.controller.start_run(project_id).await {
                Ok(run) => run,
                Err(e) => {
                    follower.abort();
                    return Err(e.into());
                }
            };
            println!("Run {} started for project {}", run.id, project_id);
            wait_and_report(&engine, run.id, timeout, follower).await?;
        }
        RunCommands::Resume { run_id, timeout } => {
            recover_stale_runs(&engine).await?;
            let follower = follow_events(&engine.sink);
            match engine.controller.resume_run(run_id).await {
                Ok(ResumeOutcome::Resumed { task_id }) => {
                    println!("Resuming run {} from task {}", run_id, task_id);
                    wait_and_report(&engine, run_id, timeout, follower).await?;
                }
                Ok(ResumeOutcome::NothingToResume) => {
                    follower.abort();
                    println!("Run {} has no failed task to resume", run_id);
                }
                Err(e) => {
                    follower.abort();
                    return Err(e.into());
                }
            }
        }
        RunCommands::Show { run_id } => {
            let run = engine.controller.get_run(run_id).await?;
            let tasks = engine.controller.run_tasks(run_id).await?;
            print_run(&run);
            print_tasks(&tasks);
        }
        RunCommands::List { project_id } => {
            let project = engine
                .db
                .call(move |db| db.get_project(project_id))
                .await?;
            if project.is_none() {
                anyhow::bail!("Project {} not found", project_id);
            }
            let runs = engine.controller.list_runs(project_id).await?;
            if runs.is_empty() {
                println!("No runs for project {}", project_id);
                return Ok(());
            }
            println!("{:<6} {:<8} {:<27} ERROR", "ID", "STATUS", "STARTED");
            for run in runs {
                println!(
                    "{:<6} {:<8} {:<27} {}",
                    run.id,
                    run.status,
                    run.started_at,
                    run.error.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
