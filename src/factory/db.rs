use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Async-safe handle to the factory database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. A closure passed to `call`
/// holds the lock for its whole body, so read-check-write sequences inside
/// one closure are atomic with respect to every other caller.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FactoryDb {
    conn: Connection,
}

const TASK_COLUMNS: &str = "id, run_id, project_id, node_id, agent_role, task_name, status, \
     progress_pct, input_context, result_context, log_content, retry_count, max_retries, \
     backoff_factor, initial_delay_seconds, attempt_history, is_retryable, error_details, \
     created_at, started_at, completed_at";

const RUN_COLUMNS: &str = "id, project_id, status, error, started_at, ended_at, owner, heartbeat_at";

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        // Several CLI processes may drive runs against the same file
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL mode")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflows (
                    project_id INTEGER PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
                    graph TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'running',
                    error TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER REFERENCES runs(id) ON DELETE CASCADE,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    node_id TEXT,
                    agent_role TEXT NOT NULL,
                    task_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    progress_pct INTEGER NOT NULL DEFAULT 0,
                    input_context TEXT NOT NULL DEFAULT '{}',
                    result_context TEXT,
                    log_content TEXT NOT NULL DEFAULT '',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    backoff_factor REAL NOT NULL DEFAULT 2.0,
                    initial_delay_seconds INTEGER NOT NULL DEFAULT 5,
                    attempt_history TEXT NOT NULL DEFAULT '[]',
                    is_retryable INTEGER NOT NULL DEFAULT 1,
                    error_details TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_agent_tasks_run ON agent_tasks(run_id);
                CREATE INDEX IF NOT EXISTS idx_agent_tasks_status ON agent_tasks(status);
                ",
            )
            .context("Failed to create tables")?;

        // Run ownership lease, added after the first schema version
        for (column, ddl) in [
            ("owner", "ALTER TABLE runs ADD COLUMN owner TEXT"),
            ("heartbeat_at", "ALTER TABLE runs ADD COLUMN heartbeat_at TEXT"),
        ] {
            match self.conn.execute(ddl, []) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column") => {}
                Err(e) => return Err(anyhow::anyhow!("Failed to add {} column: {}", column, e)),
            }
        }
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, description: &str) -> Result<Project> {
        let created_at = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO projects (name, description, created_at) VALUES (?1, ?2, ?3)",
                params![name, description, created_at],
            )
            .context("Failed to insert project")?;
        Ok(Project {
            id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.to_string(),
            created_at,
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt.query_map([], project_from_row)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, description, created_at FROM projects WHERE id = ?1",
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Workflows ─────────────────────────────────────────────────────

    /// Store (or replace) the workflow graph of a project.
    pub fn save_workflow(&self, project_id: i64, graph: &WorkflowGraph) -> Result<Workflow> {
        let graph_json = serde_json::to_string(graph).context("Failed to serialize graph")?;
        let updated_at = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO workflows (project_id, graph, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(project_id) DO UPDATE SET graph = excluded.graph, updated_at = excluded.updated_at",
                params![project_id, graph_json, updated_at],
            )
            .context("Failed to save workflow")?;
        Ok(Workflow {
            project_id,
            graph: graph.clone(),
            updated_at,
        })
    }

    pub fn get_workflow(&self, project_id: i64) -> Result<Option<Workflow>> {
        let row = self
            .conn
            .query_row(
                "SELECT project_id, graph, updated_at FROM workflows WHERE project_id = ?1",
                params![project_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query workflow")?;
        match row {
            Some((project_id, graph_json, updated_at)) => {
                let graph: WorkflowGraph = serde_json::from_str(&graph_json)
                    .context("Failed to parse stored workflow graph")?;
                Ok(Some(Workflow {
                    project_id,
                    graph,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Insert a RUNNING run owned by `owner`, with a fresh heartbeat.
    pub fn create_run(&self, project_id: i64, owner: &str) -> Result<Run> {
        let started_at = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO runs (project_id, status, started_at, owner, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?3)",
                params![project_id, RunStatus::Running.as_str(), started_at, owner],
            )
            .context("Failed to insert run")?;
        Ok(Run {
            id: self.conn.last_insert_rowid(),
            project_id,
            status: RunStatus::Running,
            error: None,
            heartbeat_at: Some(started_at.clone()),
            started_at,
            ended_at: None,
            owner: Some(owner.to_string()),
        })
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn list_runs(&self, project_id: i64) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs WHERE project_id = ?1 ORDER BY id DESC",
            RUN_COLUMNS
        );
        self.query_runs(&sql, params![project_id])
    }

    /// RUNNING runs whose owner has not heartbeated since `cutoff`.
    pub fn list_stale_runs(&self, cutoff: &str) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {} FROM runs
             WHERE status = ?1 AND (heartbeat_at IS NULL OR heartbeat_at < ?2)
             ORDER BY id",
            RUN_COLUMNS
        );
        self.query_runs(&sql, params![RunStatus::Running.as_str(), cutoff])
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt.query_map(params, RunRow::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read run row")?.into_run()?);
        }
        Ok(runs)
    }

    /// Set a run's status. Terminal statuses stamp `ended_at`; `Running`
    /// clears both `ended_at` and `error`.
    pub fn update_run_status(&self, id: i64, status: RunStatus, error: Option<&str>) -> Result<()> {
        let changed = if status.is_terminal() {
            self.conn
                .execute(
                    "UPDATE runs SET status = ?1, error = ?2, ended_at = ?3 WHERE id = ?4",
                    params![status.as_str(), error, now_timestamp(), id],
                )
                .context("Failed to update run status to terminal")?
        } else {
            self.conn
                .execute(
                    "UPDATE runs SET status = ?1, error = NULL, ended_at = NULL WHERE id = ?2",
                    params![status.as_str(), id],
                )
                .context("Failed to update run status")?
        };
        if changed == 0 {
            anyhow::bail!("Run {} does not exist", id);
        }
        Ok(())
    }

    /// Put a run back to RUNNING under `owner`, clearing `ended_at` and
    /// `error` and renewing its heartbeat.
    pub fn claim_run(&self, id: i64, owner: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET status = ?1, error = NULL, ended_at = NULL,
                        owner = ?2, heartbeat_at = ?3
                 WHERE id = ?4",
                params![RunStatus::Running.as_str(), owner, now_timestamp(), id],
            )
            .context("Failed to claim run")?;
        if changed == 0 {
            anyhow::bail!("Run {} does not exist", id);
        }
        Ok(())
    }

    /// Renew the heartbeat of the RUNNING runs among `ids`. Returns how many
    /// rows were touched.
    pub fn heartbeat_runs(&self, ids: &[i64], at: &str) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare("UPDATE runs SET heartbeat_at = ?1 WHERE id = ?2 AND status = ?3")
            .context("Failed to prepare heartbeat update")?;
        let mut touched = 0;
        for id in ids {
            touched += stmt
                .execute(params![at, id, RunStatus::Running.as_str()])
                .context("Failed to record run heartbeat")?;
        }
        Ok(touched)
    }

    /// Newest run id of a project, if any.
    pub fn latest_run_id(&self, project_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(id) FROM runs WHERE project_id = ?1",
                params![project_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .context("Failed to query latest run")
    }

    // ── Agent Tasks ──────────────────────────────────────────────────

    pub fn create_agent_task(&self, new: &NewTask) -> Result<AgentTask> {
        let input_json =
            serde_json::to_string(&new.input_context).context("Failed to serialize input context")?;
        let created_at = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO agent_tasks (run_id, project_id, node_id, agent_role, task_name, status, \
                 input_context, max_retries, backoff_factor, initial_delay_seconds, is_retryable, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    new.run_id,
                    new.project_id,
                    new.node_id,
                    new.agent_role.as_str(),
                    new.task_name,
                    TaskStatus::Pending.as_str(),
                    input_json,
                    new.retry.max_retries,
                    new.retry.backoff_factor,
                    new.retry.initial_delay_seconds,
                    new.retry.retryable,
                    created_at,
                ],
            )
            .context("Failed to insert agent task")?;
        Ok(AgentTask {
            id: self.conn.last_insert_rowid(),
            run_id: new.run_id,
            project_id: new.project_id,
            node_id: new.node_id.clone(),
            agent_role: new.agent_role.clone(),
            task_name: new.task_name.clone(),
            status: TaskStatus::Pending,
            progress_pct: 0,
            input_context: new.input_context.clone(),
            result_context: None,
            log_content: String::new(),
            retry_count: 0,
            max_retries: new.retry.max_retries,
            backoff_factor: new.retry.backoff_factor,
            initial_delay_seconds: new.retry.initial_delay_seconds,
            attempt_history: Vec::new(),
            is_retryable: new.retry.retryable,
            error_details: None,
            created_at,
            started_at: None,
            completed_at: None,
        })
    }

    /// Write back every mutable column of a task.
    pub fn update_agent_task(&self, task: &AgentTask) -> Result<()> {
        let result_json = task
            .result_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize result context")?;
        let history_json = serde_json::to_string(&task.attempt_history)
            .context("Failed to serialize attempt history")?;
        let changed = self
            .conn
            .execute(
                "UPDATE agent_tasks SET status = ?1, progress_pct = ?2, result_context = ?3, \
                 log_content = ?4, retry_count = ?5, attempt_history = ?6, error_details = ?7, \
                 started_at = ?8, completed_at = ?9 WHERE id = ?10",
                params![
                    task.status.as_str(),
                    task.progress_pct,
                    result_json,
                    task.log_content,
                    task.retry_count,
                    history_json,
                    task.error_details,
                    task.started_at,
                    task.completed_at,
                    task.id,
                ],
            )
            .context("Failed to update agent task")?;
        if changed == 0 {
            anyhow::bail!("Agent task {} does not exist", task.id);
        }
        Ok(())
    }

    pub fn get_agent_task(&self, id: i64) -> Result<Option<AgentTask>> {
        let sql = format!("SELECT {} FROM agent_tasks WHERE id = ?1", TASK_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], AgentTaskRow::from_row)
            .optional()
            .context("Failed to query agent task")?;
        row.map(AgentTaskRow::into_agent_task).transpose()
    }

    /// Tasks of a run in creation order.
    pub fn list_run_tasks(&self, run_id: i64) -> Result<Vec<AgentTask>> {
        let sql = format!(
            "SELECT {} FROM agent_tasks WHERE run_id = ?1 ORDER BY id",
            TASK_COLUMNS
        );
        self.query_tasks(&sql, params![run_id])
    }

    pub fn list_run_tasks_with_status(
        &self,
        run_id: i64,
        statuses: &[TaskStatus],
    ) -> Result<Vec<AgentTask>> {
        Ok(self
            .list_run_tasks(run_id)?
            .into_iter()
            .filter(|t| statuses.contains(&t.status))
            .collect())
    }

    /// The most recently created failed task of a run.
    pub fn latest_failed_task(&self, run_id: i64) -> Result<Option<AgentTask>> {
        let sql = format!(
            "SELECT {} FROM agent_tasks WHERE run_id = ?1 AND status = ?2 ORDER BY id DESC LIMIT 1",
            TASK_COLUMNS
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![run_id, TaskStatus::Fail.as_str()],
                AgentTaskRow::from_row,
            )
            .optional()
            .context("Failed to query failed task")?;
        row.map(AgentTaskRow::into_agent_task).transpose()
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<AgentTask>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt.query_map(params, AgentTaskRow::from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_agent_task()?);
        }
        Ok(tasks)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Intermediate row struct for runs before parsing the status string.
struct RunRow {
    id: i64,
    project_id: i64,
    status: String,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
    owner: Option<String>,
    heartbeat_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            status: row.get(2)?,
            error: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
            owner: row.get(6)?,
            heartbeat_at: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run status")?;
        Ok(Run {
            id: self.id,
            project_id: self.project_id,
            status,
            error: self.error,
            started_at: self.started_at,
            ended_at: self.ended_at,
            owner: self.owner,
            heartbeat_at: self.heartbeat_at,
        })
    }
}

/// Intermediate row struct for agent_tasks: enums and JSON columns are
/// still raw strings here.
struct AgentTaskRow {
    id: i64,
    run_id: Option<i64>,
    project_id: i64,
    node_id: Option<String>,
    agent_role: String,
    task_name: String,
    status: String,
    progress_pct: u8,
    input_context: String,
    result_context: Option<String>,
    log_content: String,
    retry_count: u32,
    max_retries: u32,
    backoff_factor: f64,
    initial_delay_seconds: u32,
    attempt_history: String,
    is_retryable: bool,
    error_details: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl AgentTaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            project_id: row.get(2)?,
            node_id: row.get(3)?,
            agent_role: row.get(4)?,
            task_name: row.get(5)?,
            status: row.get(6)?,
            progress_pct: row.get(7)?,
            input_context: row.get(8)?,
            result_context: row.get(9)?,
            log_content: row.get(10)?,
            retry_count: row.get(11)?,
            max_retries: row.get(12)?,
            backoff_factor: row.get(13)?,
            initial_delay_seconds: row.get(14)?,
            attempt_history: row.get(15)?,
            is_retryable: row.get(16)?,
            error_details: row.get(17)?,
            created_at: row.get(18)?,
            started_at: row.get(19)?,
            completed_at: row.get(20)?,
        })
    }

    fn into_agent_task(self) -> Result<AgentTask> {
        let agent_role = AgentRole::from_str(&self.agent_role)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse agent role")?;
        let status = TaskStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let input_context: ContextMap = serde_json::from_str(&self.input_context)
            .context("Failed to parse input context JSON")?;
        let result_context: Option<ContextMap> = self
            .result_context
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse result context JSON")?;
        let attempt_history: Vec<AttemptRecord> = serde_json::from_str(&self.attempt_history)
            .context("Failed to parse attempt history JSON")?;

        Ok(AgentTask {
            id: self.id,
            run_id: self.run_id,
            project_id: self.project_id,
            node_id: self.node_id,
            agent_role,
            task_name: self.task_name,
            status,
            progress_pct: self.progress_pct,
            input_context,
            result_context,
            log_content: self.log_content,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            backoff_factor: self.backoff_factor,
            initial_delay_seconds: self.initial_delay_seconds,
            attempt_history,
            is_retryable: self.is_retryable,
            error_details: self.error_details,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
