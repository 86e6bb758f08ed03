//! Task commands (`agent-factory task`).

use std::time::Duration;

use anyhow::{Context, Result};

use super::{follow_events, open_engine, recover_stale_runs, wait_and_report};
use crate::{Cli, TaskCommands};

pub async fn cmd_task(cli: &Cli, command: TaskCommands) -> Result<()> {
    let engine = open_engine(cli).await?;

    match command {
        TaskCommands::Retry { task_id, timeout } => {
            recover_stale_runs(&engine).await?;
            let follower = follow_events(&engine.sink);
            let task = match engine.controller.retry_task(task_id).await {
                Ok(task) => task,
                Err(e) => {
                    follower.abort();
                    return Err(e.into());
                }
            };
            println!("Retrying task {} ({})", task.id, task.task_name);
            match task.run_id {
                Some(run_id) => wait_and_report(&engine, run_id, timeout, follower).await?,
                None => {
                    tokio::time::timeout(Duration::from_secs(timeout), engine.controller.wait_idle())
                        .await
                        .context("Timed out waiting for task")?;
                    follower.abort();
                    let task = engine.controller.get_task(task_id).await?;
                    println!("Task {} finished: {}", task.id, task.status);
                }
            }
        }
        TaskCommands::Show { task_id } => {
            let task = engine.controller.get_task(task_id).await?;
            println!("Task {}: {} [{}]", task.id, task.task_name, task.agent_role);
            println!("  status:   {} ({}%)", task.status, task.progress_pct);
            if let Some(run_id) = task.run_id {
                println!("  run:      {}", run_id);
            }
            if let Some(node_id) = &task.node_id {
                println!("  node:     {}", node_id);
            }
            println!(
                "  retries:  {}/{} (backoff {}s x{}, retryable: {})",
                task.retry_count,
                task.max_retries,
                task.initial_delay_seconds,
                task.backoff_factor,
                task.is_retryable
            );
            if let Some(error) = &task.error_details {
                println!("  error:    {}", error);
            }
            if !task.attempt_history.is_empty() {
                println!();
                println!("Attempts:");
                for record in &task.attempt_history {
                    println!("  #{} {} {}", record.attempt, record.timestamp, record.error);
                }
            }
            if let Some(result) = &task.result_context {
                println!();
                println!("Result:");
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            if !task.log_content.is_empty() {
                println!();
                println!("Log:");
                print!("{}", task.log_content);
            }
        }
    }
    Ok(())
}
