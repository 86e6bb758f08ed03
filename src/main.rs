use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "agent-factory")]
#[command(version, about = "Sequence, retry and resume graphs of LLM-backed agent tasks")]
pub struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Database path (default: .factory/factory.db)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Config file path (default: .factory/factory.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(cmd::FACTORY_DIR).join("factory.db"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            PathBuf::from(cmd::FACTORY_DIR).join(agent_factory::factory_config::CONFIG_FILE)
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the factory database and a default factory.toml
    Init,
    /// Create or list projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Store, show or validate a project's workflow graph
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Start, resume and inspect runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Retry or inspect a single agent task
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Create a project
    Create {
        name: String,
        /// Seeds the run context under `description`
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List all projects
    List,
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// Validate a graph file and store it as the project's workflow
    Set { project_id: i64, file: PathBuf },
    /// Show a project's workflow in execution order
    Show { project_id: i64 },
    /// Compile a graph file and print its execution order
    Validate { file: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum RunCommands {
    /// Start a run and wait for it to finish
    Start {
        project_id: i64,
        /// Seconds to wait before giving up
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },
    /// Resume a failed run from its most recent failed task
    Resume {
        run_id: i64,
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },
    /// Show a run and its tasks
    Show { run_id: i64 },
    /// List runs of a project, newest first
    List { project_id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Manually retry a failed task and continue its run
    Retry {
        task_id: i64,
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },
    /// Show a task with its attempt history and log
    Show { task_id: i64 },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "agent_factory=debug,info"
    } else {
        "agent_factory=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&cli)?,
        Commands::Project { command } => cmd::cmd_project(&cli, command.clone()).await?,
        Commands::Workflow { command } => cmd::cmd_workflow(&cli, command.clone()).await?,
        Commands::Run { command } => cmd::cmd_run(&cli, command.clone()).await?,
        Commands::Task { command } => cmd::cmd_task(&cli, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
