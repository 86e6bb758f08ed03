//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `init`     | `Init`           |
//! | `project`  | `Project`        |
//! | `workflow` | `Workflow`       |
//! | `run`      | `Run`            |
//! | `task`     | `Task`           |
//! | `config`   | `Config`         |
//!
//! Shared plumbing (opening the database, building the engine, printing
//! tasks and following events) lives here.

pub mod config;
pub mod init;
pub mod project;
pub mod run;
pub mod task;
pub mod workflow;

pub use config::cmd_config;
pub use init::cmd_init;
pub use project::cmd_project;
pub use run::cmd_run;
pub use task::cmd_task;
pub use workflow::cmd_workflow;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use agent_factory::factory::db::{DbHandle, FactoryDb};
use agent_factory::factory::events::BroadcastSink;
use agent_factory::factory::llm::CommandLlmClient;
use agent_factory::factory::models::{AgentTask, Run, RunStatus};
use agent_factory::factory::{BuiltinPlugin, CapabilityRegistry, RunController};
use agent_factory::factory_config::FactoryToml;

use crate::Cli;

pub const FACTORY_DIR: &str = ".factory";

/// A fully wired engine for one CLI invocation. Plugins are torn down when
/// it is dropped.
pub struct Engine {
    pub controller: RunController,
    pub sink: BroadcastSink,
    pub db: DbHandle,
    registry: Arc<CapabilityRegistry>,
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.registry.teardown();
    }
}

pub fn load_config(cli: &Cli) -> Result<FactoryToml> {
    let path = cli.config_path();
    if path.exists() {
        FactoryToml::load(&path)
    } else {
        Ok(FactoryToml::default())
    }
}

pub fn open_db(cli: &Cli) -> Result<DbHandle> {
    let path = cli.db_path();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(DbHandle::new(FactoryDb::new(&path)?))
}

/// Build the engine. Does not touch runs of other processes.
pub async fn open_engine(cli: &Cli) -> Result<Engine> {
    let config = load_config(cli)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    let db = open_db(cli)?;
    let sink = BroadcastSink::default();
    let registry = Arc::new(
        CapabilityRegistry::builder()
            .with_plugin_config(config.plugins.clone())
            .register_plugin(Arc::new(BuiltinPlugin::new()))
            .build(),
    );
    let llm = CommandLlmClient::new(&config.llm_command(), &config.llm.args);

    let controller = RunController::new(
        db.clone(),
        registry.clone(),
        Arc::new(llm),
        Arc::new(sink.clone()),
        config.engine_options()?,
    );
    Ok(Engine {
        controller,
        sink,
        db,
        registry,
    })
}

/// Fail runs whose owning process stopped heartbeating. Only commands that
/// drive runs call this; read-only commands leave the database untouched.
pub async fn recover_stale_runs(engine: &Engine) -> Result<()> {
    let recovered = engine.controller.recover_interrupted_runs().await?;
    if !recovered.is_empty() {
        println!(
            "Marked {} interrupted run(s) as failed: {:?}",
            recovered.len(),
            recovered
        );
    }
    Ok(())
}

/// Print task events as they are published until the handle is aborted.
pub fn follow_events(sink: &BroadcastSink) -> JoinHandle<()> {
    let mut rx = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    let e = msg.event;
                    println!(
                        "  [{:<15}] #{} {} ({}%) {}",
                        e.event_type, e.task_id, e.task_name, e.progress, e.message
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    println!("  ... {} event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Wait for a run while echoing its events, then print the outcome.
/// Errors when the run ends in FAIL.
pub async fn wait_and_report(engine: &Engine, run_id: i64, timeout_secs: u64, follower: JoinHandle<()>) -> Result<()> {
    let waited = engine
        .controller
        .wait_for_run(run_id, Duration::from_secs(timeout_secs))
        .await;
    follower.abort();
    let run = waited?;

    let tasks = engine.controller.run_tasks(run_id).await?;
    println!();
    print_run(&run);
    print_tasks(&tasks);

    if run.status == RunStatus::Fail {
        anyhow::bail!(
            "Run {} failed: {}",
            run.id,
            run.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub fn print_run(run: &Run) {
    println!("Run {} (project {}): {}", run.id, run.project_id, run.status);
    println!("  started: {}", run.started_at);
    if let Some(owner) = &run.owner {
        println!("  owner:   {}", owner);
    }
    if let Some(ended) = &run.ended_at {
        println!("  ended:   {}", ended);
    }
    if let Some(error) = &run.error {
        println!("  error:   {}", error);
    }
}

pub fn print_tasks(tasks: &[AgentTask]) {
    if tasks.is_empty() {
        println!("  (no tasks)");
        return;
    }
    println!();
    println!(
        "  {:<6} {:<10} {:<24} {:<11} {:>5} {:>7}",
        "ID", "ROLE", "NAME", "STATUS", "PCT", "RETRIES"
    );
    for task in tasks {
        println!(
            "  {:<6} {:<10} {:<24} {:<11} {:>4}% {:>3}/{:<3}",
            task.id,
            task.agent_role,
            truncate(&task.task_name, 24),
            task.status,
            task.progress_pct,
            task.retry_count,
            task.max_retries
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
