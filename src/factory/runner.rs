//! Run orchestration: one sequential walk over a compiled workflow per run.
//!
//! ```text
//! start_run ── compile ── create run ── pool.submit(walk)
//!                                          │
//!            ┌─────────────────────────────┘
//!            ▼
//!   for node in plan[start..]:
//!       superseded? ── yes ──> run FAIL, stop
//!       create task ── start ── dispatch
//!           ok  ──> complete, merge result into context
//!           err ──> RetryController
//!                     Scheduled ──> timer ──> fire_retry ──> continue_task ──> walk(ordinal+1)
//!                     Permanent ──> run FAIL, stop
//!   run SUCCESS
//! ```
//!
//! Runs are independent of each other and share the worker pool. Nothing in
//! a walk blocks a worker while waiting for a retry timer.
//!
//! Every run this controller drives carries its `owner` id and a heartbeat
//! renewed every third of `run_lease`. Only runs whose heartbeat is older
//! than the lease are treated as interrupted, so several processes can share
//! one database.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::capability::{CapabilityDispatcher, CapabilityRegistry, panic_message, summary_of};
use super::db::DbHandle;
use super::events::EventSink;
use super::llm::LlmClient;
use super::models::*;
use super::pool::WorkerPool;
use super::retry::{RetryController, RetryDecision, RetryPolicy};
use super::task_store::TaskStore;
use crate::dag::GraphCompiler;
use crate::errors::{CapabilityError, EngineError};

const INTERRUPTED: &str = "Interrupted: the engine stopped while this run was in progress";
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_ENGINE: AtomicU64 = AtomicU64::new(0);

/// Knobs for building a `RunController`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub worker_pool_size: usize,
    pub capability_timeout: Option<Duration>,
    pub required_roles: Vec<AgentRole>,
    /// Retry settings stamped onto every new task, before per-node overrides.
    pub retry_defaults: RetrySettings,
    pub retry_policy: RetryPolicy,
    /// How long a RUNNING run may go without a heartbeat before another
    /// engine treats it as interrupted.
    pub run_lease: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            capability_timeout: Some(Duration::from_secs(600)),
            required_roles: AgentRole::required(),
            retry_defaults: RetrySettings::default(),
            retry_policy: RetryPolicy::default(),
            run_lease: Duration::from_secs(30),
        }
    }
}

/// Result of `RunController::resume_run`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The run's most recent failed task was handed to `retry_task`.
    Resumed { task_id: i64 },
    /// The run has no failed task to restart.
    NothingToResume,
}

#[derive(Clone)]
pub struct RunController {
    inner: Arc<Inner>,
}

struct Inner {
    db: DbHandle,
    tasks: TaskStore,
    dispatcher: CapabilityDispatcher,
    retry: RetryController,
    pool: WorkerPool,
    compiler: GraphCompiler,
    retry_defaults: RetrySettings,
    owner: String,
    run_lease: Duration,
    owned_runs: Mutex<HashSet<i64>>,
    heartbeat_started: AtomicBool,
}

impl Inner {
    fn owned_runs(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.owned_runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RunController {
    pub fn new(
        db: DbHandle,
        registry: Arc<CapabilityRegistry>,
        llm: Arc<dyn LlmClient>,
        sink: Arc<dyn EventSink>,
        options: EngineOptions,
    ) -> Self {
        let tasks = TaskStore::new(db.clone(), sink);
        let pool = WorkerPool::new(options.worker_pool_size);
        let dispatcher = CapabilityDispatcher::new(registry, llm, tasks.clone())
            .with_timeout(options.capability_timeout);
        let retry = RetryController::new(tasks.clone(), pool.clone(), options.retry_policy);
        Self {
            inner: Arc::new(Inner {
                db,
                tasks,
                dispatcher,
                retry,
                pool,
                compiler: GraphCompiler::with_required_roles(options.required_roles),
                retry_defaults: options.retry_defaults,
                owner: format!(
                    "{}-{}-{}",
                    std::process::id(),
                    chrono::Utc::now().timestamp_millis(),
                    NEXT_ENGINE.fetch_add(1, Ordering::Relaxed)
                ),
                run_lease: options.run_lease,
                owned_runs: Mutex::new(HashSet::new()),
                heartbeat_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    /// Id written to the `owner` column of every run this controller drives.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    // ── Operations ───────────────────────────────────────────────────

    /// Compile the project's workflow and start walking it in the background.
    ///
    /// Graph errors are returned before anything is persisted.
    pub async fn start_run(&self, project_id: i64) -> Result<Run, EngineError> {
        let (project, workflow) = self
            .inner
            .db
            .call(move |db| Ok((db.get_project(project_id)?, db.get_workflow(project_id)?)))
            .await
            .map_err(EngineError::Database)?;
        let project = project.ok_or(EngineError::ProjectNotFound { id: project_id })?;
        let workflow = workflow.ok_or(EngineError::WorkflowNotFound { project_id })?;

        let plan = Arc::new(self.inner.compiler.compile_graph(&workflow.graph)?);

        let owner = self.inner.owner.clone();
        let run = self
            .inner
            .db
            .call(move |db| db.create_run(project_id, &owner))
            .await
            .map_err(EngineError::Database)?;
        self.own_run(run.id);
        info!(run_id = run.id, project_id, owner = self.owner(), nodes = plan.len(), "Run started");

        let mut context = ContextMap::new();
        if !project.description.trim().is_empty() {
            context.insert("description".to_string(), Value::String(project.description));
        }
        self.inner.pool.submit(self.walk(run.id, project_id, plan, 0, context));
        Ok(run)
    }

    /// Restart a failed or waiting task by hand and, on success, continue
    /// its run from the next node.
    pub async fn retry_task(&self, task_id: i64) -> Result<AgentTask, EngineError> {
        let task = self.inner.tasks.get(task_id).await?;
        if let Some(run_id) = task.run_id {
            self.ensure_not_superseded(run_id, task.project_id).await?;
        }

        let task = self.inner.tasks.begin_manual_retry(task_id).await?;
        if let Some(run_id) = task.run_id {
            let owner = self.inner.owner.clone();
            self.inner
                .db
                .call(move |db| db.claim_run(run_id, &owner))
                .await
                .map_err(EngineError::Database)?;
            self.own_run(run_id);
        }
        info!(task_id, run_id = ?task.run_id, role = %task.agent_role, "Manual retry started");

        self.inner.pool.submit(self.continue_task(task.clone(), None));
        Ok(task)
    }

    /// Restart a finished run from its most recent failed task.
    pub async fn resume_run(&self, run_id: i64) -> Result<ResumeOutcome, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status == RunStatus::Running {
            return Err(EngineError::RunAlreadyRunning { run_id });
        }
        self.ensure_not_superseded(run_id, run.project_id).await?;

        let failed = self
            .inner
            .db
            .call(move |db| db.latest_failed_task(run_id))
            .await
            .map_err(EngineError::Database)?;
        match failed {
            Some(task) => {
                info!(run_id, task_id = task.id, "Resuming run");
                self.retry_task(task.id).await?;
                Ok(ResumeOutcome::Resumed { task_id: task.id })
            }
            None => {
                info!(run_id, status = %run.status, "Nothing to resume");
                Ok(ResumeOutcome::NothingToResume)
            }
        }
    }

    /// Fail every RUNNING run whose owner stopped heartbeating for longer
    /// than the run lease, together with its unfinished tasks, so that the
    /// runs can be resumed. Runs with a live owner are left alone.
    pub async fn recover_interrupted_runs(&self) -> Result<Vec<i64>, EngineError> {
        let lease = chrono::Duration::from_std(self.inner.run_lease)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(lease)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let mine: HashSet<i64> = self.inner.owned_runs().clone();

        let orphaned = self
            .inner
            .db
            .call(move |db| {
                let mut orphaned = Vec::new();
                for run in db.list_stale_runs(&cutoff)? {
                    if mine.contains(&run.id) {
                        continue;
                    }
                    let open = db.list_run_tasks_with_status(
                        run.id,
                        &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::RetryWait],
                    )?;
                    orphaned.push((run.id, open));
                }
                Ok(orphaned)
            })
            .await
            .map_err(EngineError::Database)?;

        let mut recovered = Vec::with_capacity(orphaned.len());
        for (run_id, open_tasks) in orphaned {
            // The owner may have renewed its lease since the scan
            if self.heartbeat_is_fresh(run_id).await? {
                continue;
            }
            for task in open_tasks {
                self.inner.tasks.fail(task.id, INTERRUPTED).await?;
            }
            self.set_run_status(run_id, RunStatus::Fail, Some(INTERRUPTED))
                .await?;
            warn!(run_id, "Recovered interrupted run");
            recovered.push(run_id);
        }
        Ok(recovered)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_run(&self, run_id: i64) -> Result<Run, EngineError> {
        self.inner
            .db
            .call(move |db| db.get_run(run_id))
            .await
            .map_err(EngineError::Database)?
            .ok_or(EngineError::RunNotFound { id: run_id })
    }

    /// Runs of a project, newest first.
    pub async fn list_runs(&self, project_id: i64) -> Result<Vec<Run>, EngineError> {
        self.inner
            .db
            .call(move |db| db.list_runs(project_id))
            .await
            .map_err(EngineError::Database)
    }

    pub async fn run_tasks(&self, run_id: i64) -> Result<Vec<AgentTask>, EngineError> {
        self.inner.tasks.list_run_tasks(run_id).await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<AgentTask, EngineError> {
        self.inner.tasks.get(task_id).await
    }

    /// Poll until the run leaves RUNNING or `timeout` elapses.
    pub async fn wait_for_run(&self, run_id: i64, timeout: Duration) -> Result<Run, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Other(anyhow::anyhow!(
                    "Timed out after {:?} waiting for run {}",
                    timeout,
                    run_id
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait for every walk and armed retry timer to finish.
    pub async fn wait_idle(&self) {
        self.inner.pool.drain().await;
    }

    // ── Background jobs ──────────────────────────────────────────────

    /// Execute `plan[start..]` for `run_id`, threading `context`.
    fn walk(
        &self,
        run_id: i64,
        project_id: i64,
        plan: Arc<Vec<Node>>,
        start: usize,
        context: ContextMap,
    ) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let outcome = AssertUnwindSafe(this.walk_nodes(run_id, project_id, plan, start, context))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("Run walk panicked: {}", panic_message(panic.as_ref())),
            };
            error!(run_id, error = %error, "Run walk aborted");
            this.abort_run(run_id, &error).await;
        })
    }

    async fn walk_nodes(
        &self,
        run_id: i64,
        project_id: i64,
        plan: Arc<Vec<Node>>,
        start: usize,
        mut context: ContextMap,
    ) -> Result<(), EngineError> {
        for node in plan.iter().skip(start) {
            if self.stop_if_superseded(run_id, project_id).await? {
                return Ok(());
            }

            let task = self
                .inner
                .tasks
                .create_task(NewTask {
                    run_id: Some(run_id),
                    project_id,
                    node_id: Some(node.id.clone()),
                    agent_role: node.agent_role.clone(),
                    task_name: node.task_name(),
                    input_context: context.clone(),
                    retry: self.inner.retry_defaults.with_node_overrides(&node.data),
                })
                .await?;
            let task = self.inner.tasks.start(task.id).await?;

            match self.execute(&task, context.clone(), Some(plan.clone())).await? {
                Some(result) => merge_context(&mut context, &result),
                None => return Ok(()),
            }
        }

        self.finish_run(run_id, RunStatus::Success, None).await;
        Ok(())
    }

    /// Timer callback for an automatic retry.
    fn fire_retry(&self, task_id: i64, plan: Option<Arc<Vec<Node>>>) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let task = match this.inner.tasks.get(task_id).await {
                Ok(task) => task,
                Err(e) => {
                    error!(task_id, error = %e, "Failed to load task for scheduled retry");
                    return;
                }
            };
            if let Some(run_id) = task.run_id {
                match this.stop_if_superseded(run_id, task.project_id).await {
                    Ok(false) => {}
                    Ok(true) => {
                        if let Err(e) = this.inner.tasks.fail(task_id, "Run was superseded").await {
                            debug!(task_id, error = %e, "Superseded task already left RETRY_WAIT");
                        }
                        return;
                    }
                    Err(e) => {
                        error!(task_id, run_id, error = %e, "Supersession check failed");
                        this.finish_run(run_id, RunStatus::Fail, Some(&e.to_string()))
                            .await;
                        return;
                    }
                }
            }

            let task = match this.inner.tasks.start(task_id).await {
                Ok(task) => task,
                Err(EngineError::InvalidTransition { .. })
                | Err(EngineError::ConcurrentModification { .. }) => {
                    debug!(task_id, "Task no longer waiting, dropping scheduled retry");
                    return;
                }
                Err(e) => {
                    error!(task_id, error = %e, "Failed to start scheduled retry");
                    if let Some(run_id) = task.run_id {
                        this.finish_run(run_id, RunStatus::Fail, Some(&e.to_string()))
                            .await;
                    }
                    return;
                }
            };
            this.continue_task(task, plan).await;
        })
    }

    /// Re-dispatch a RUNNING task with its stored input and, on success,
    /// walk the rest of its run.
    fn continue_task(&self, task: AgentTask, plan: Option<Arc<Vec<Node>>>) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let task_id = task.id;
            let run_id = task.run_id;
            let outcome = AssertUnwindSafe(this.continue_task_inner(task, plan))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("Retry continuation panicked: {}", panic_message(panic.as_ref())),
            };
            error!(task_id, run_id = ?run_id, error = %error, "Retry continuation aborted");
            match run_id {
                Some(run_id) => this.abort_run(run_id, &error).await,
                None => {
                    if let Err(e) = this.inner.tasks.fail(task_id, &error).await {
                        debug!(task_id, error = %e, "Task already left its open state");
                    }
                }
            }
        })
    }

    async fn continue_task_inner(
        &self,
        task: AgentTask,
        plan: Option<Arc<Vec<Node>>>,
    ) -> Result<(), EngineError> {
        let inputs = task.input_context.clone();
        let Some(result) = self.execute(&task, inputs.clone(), plan.clone()).await? else {
            return Ok(());
        };
        let Some(run_id) = task.run_id else {
            return Ok(());
        };

        let plan = match plan {
            Some(plan) => plan,
            None => Arc::new(self.load_plan(task.project_id).await?),
        };
        let run_tasks = self.inner.tasks.list_run_tasks(run_id).await?;
        let ordinal = run_tasks
            .iter()
            .position(|t| t.id == task.id)
            .ok_or(EngineError::TaskNotFound { id: task.id })?;

        let mut context = inputs;
        merge_context(&mut context, &result);
        debug!(task_id = task.id, run_id, next = ordinal + 1, "Continuing run after retry");
        self.walk(run_id, task.project_id, plan, ordinal + 1, context)
            .await;
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Dispatch a RUNNING task. Returns the result on success, `None` when
    /// the failure was handed to the retry controller.
    async fn execute(
        &self,
        task: &AgentTask,
        inputs: ContextMap,
        plan: Option<Arc<Vec<Node>>>,
    ) -> Result<Option<ContextMap>, EngineError> {
        match self
            .inner
            .dispatcher
            .execute(task.id, &task.agent_role, inputs)
            .await
        {
            Ok(result) => {
                let summary = summary_of(&result);
                self.inner
                    .tasks
                    .complete(task.id, result.clone(), &summary)
                    .await?;
                Ok(Some(result))
            }
            Err(err) => {
                self.handle_failure(task, &err, plan).await?;
                Ok(None)
            }
        }
    }

    async fn handle_failure(
        &self,
        task: &AgentTask,
        err: &CapabilityError,
        plan: Option<Arc<Vec<Node>>>,
    ) -> Result<(), EngineError> {
        match self.inner.retry.on_failure(task, err).await? {
            RetryDecision::Scheduled {
                effective_delay, ..
            } => {
                let job = self.fire_retry(task.id, plan);
                self.inner.retry.schedule(effective_delay, job);
            }
            RetryDecision::PermanentFailure { attempts } => {
                if let Some(run_id) = task.run_id {
                    let exhausted = EngineError::RetryExhausted {
                        task_id: task.id,
                        attempts,
                        last_error: err.to_string(),
                    };
                    self.finish_run(run_id, RunStatus::Fail, Some(&exhausted.to_string()))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn load_plan(&self, project_id: i64) -> Result<Vec<Node>, EngineError> {
        let workflow = self
            .inner
            .db
            .call(move |db| db.get_workflow(project_id))
            .await
            .map_err(EngineError::Database)?
            .ok_or(EngineError::WorkflowNotFound { project_id })?;
        Ok(self.inner.compiler.compile_graph(&workflow.graph)?)
    }

    async fn newer_run(&self, run_id: i64, project_id: i64) -> Result<Option<i64>, EngineError> {
        let latest = self
            .inner
            .db
            .call(move |db| db.latest_run_id(project_id))
            .await
            .map_err(EngineError::Database)?;
        Ok(latest.filter(|&id| id > run_id))
    }

    async fn ensure_not_superseded(&self, run_id: i64, project_id: i64) -> Result<(), EngineError> {
        match self.newer_run(run_id, project_id).await? {
            Some(newer_run_id) => Err(EngineError::RunSuperseded {
                run_id,
                newer_run_id,
            }),
            None => Ok(()),
        }
    }

    /// Fail `run_id` if a newer run exists for its project.
    async fn stop_if_superseded(&self, run_id: i64, project_id: i64) -> Result<bool, EngineError> {
        let Some(newer) = self.newer_run(run_id, project_id).await? else {
            return Ok(false);
        };
        warn!(run_id, newer_run_id = newer, "Run superseded, stopping");
        self.finish_run(run_id, RunStatus::Fail, Some(&format!("Superseded by run {}", newer)))
            .await;
        Ok(true)
    }

    async fn set_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        let error = error.map(str::to_string);
        self.inner
            .db
            .call(move |db| db.update_run_status(run_id, status, error.as_deref()))
            .await
            .map_err(EngineError::Database)
    }

    /// Best-effort terminal update from a background job.
    async fn finish_run(&self, run_id: i64, status: RunStatus, error: Option<&str>) {
        match status {
            RunStatus::Success => info!(run_id, "Run completed"),
            _ => warn!(run_id, error = error.unwrap_or(""), "Run failed"),
        }
        if let Err(e) = self.set_run_status(run_id, status, error).await {
            error!(run_id, status = %status, error = %e, "Failed to record run status");
        }
        self.inner.owned_runs().remove(&run_id);
    }

    /// Fail a run whose walk broke off, along with its unfinished tasks, so
    /// that it can be resumed.
    async fn abort_run(&self, run_id: i64, error: &str) {
        let open = self
            .inner
            .db
            .call(move |db| {
                db.list_run_tasks_with_status(
                    run_id,
                    &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::RetryWait],
                )
            })
            .await;
        match open {
            Ok(open) => {
                for task in open {
                    if let Err(e) = self.inner.tasks.fail(task.id, error).await {
                        warn!(run_id, task_id = task.id, error = %e, "Failed to fail open task");
                    }
                }
            }
            Err(e) => warn!(run_id, error = %format!("{:#}", e), "Failed to list open tasks"),
        }
        self.finish_run(run_id, RunStatus::Fail, Some(error)).await;
    }

    async fn heartbeat_is_fresh(&self, run_id: i64) -> Result<bool, EngineError> {
        let run = self.get_run(run_id).await?;
        let lease = chrono::Duration::from_std(self.inner.run_lease)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let fresh = run
            .heartbeat_at
            .as_deref()
            .and_then(|at| chrono::DateTime::parse_from_rfc3339(at).ok())
            .is_some_and(|at| chrono::Utc::now().signed_duration_since(at) < lease);
        Ok(run.status == RunStatus::Running && fresh)
    }

    /// Track `run_id` as driven by this controller and make sure the
    /// heartbeat loop is running.
    fn own_run(&self, run_id: i64) {
        self.inner.owned_runs().insert(run_id);
        if self.inner.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let every = (self.inner.run_lease / 3).max(MIN_HEARTBEAT_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let ids: Vec<i64> = inner.owned_runs().iter().copied().collect();
                if ids.is_empty() {
                    continue;
                }
                let at = now_timestamp();
                if let Err(e) = inner.db.call(move |db| db.heartbeat_runs(&ids, &at)).await {
                    warn!(owner = %inner.owner, error = %format!("{:#}", e), "Failed to renew run heartbeat");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::db::FactoryDb;
    use crate::factory::events::BroadcastSink;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoLlm;

    #[async_trait]
    impl LlmClient for NoLlm {
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("no model configured")
        }
    }

    fn pipeline() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                Node::new("pm", AgentRole::Pm, "Plan"),
                Node::new("sa", AgentRole::Sa, "Design"),
                Node::new("pg", AgentRole::Pg, "Build"),
                Node::new("qa", AgentRole::Qa, "Test"),
            ],
            edges: vec![
                Edge::new("pm", "sa"),
                Edge::new("sa", "pg"),
                Edge::new("pg", "qa"),
            ],
        }
    }

    fn echo_registry() -> Arc<CapabilityRegistry> {
        let mut builder = CapabilityRegistry::builder();
        for role in AgentRole::required() {
            let name = role.to_string();
            builder = builder.register_fn(role, move |_ctx| {
                let name = name.clone();
                async move {
                    let mut out = ContextMap::new();
                    out.insert("last".into(), json!(name));
                    Ok(out)
                }
            });
        }
        Arc::new(builder.build())
    }

    async fn setup(registry: Arc<CapabilityRegistry>) -> Result<(RunController, i64)> {
        let db = DbHandle::new(FactoryDb::new_in_memory()?);
        let project = db.call(|db| db.create_project("alpha", "A todo app")).await?;
        let project_id = project.id;
        db.call(move |db| db.save_workflow(project_id, &pipeline())).await?;
        Ok((controller_on(db, registry), project_id))
    }

    fn controller_on(db: DbHandle, registry: Arc<CapabilityRegistry>) -> RunController {
        let options = EngineOptions {
            retry_policy: RetryPolicy::with_delay_override(Duration::from_millis(5)),
            ..EngineOptions::default()
        };
        RunController::new(
            db,
            registry,
            Arc::new(NoLlm),
            Arc::new(BroadcastSink::default()),
            options,
        )
    }

    /// Every role echoes, but PM waits for `gate` first.
    fn gated_registry(gate: Arc<tokio::sync::Notify>) -> Arc<CapabilityRegistry> {
        let mut builder = CapabilityRegistry::builder();
        for role in AgentRole::required() {
            let gate = (role == AgentRole::Pm).then(|| gate.clone());
            builder = builder.register_fn(role, move |_ctx| {
                let gate = gate.clone();
                async move {
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    Ok(ContextMap::new())
                }
            });
        }
        Arc::new(builder.build())
    }

    #[tokio::test]
    async fn test_run_walks_nodes_in_order() -> Result<()> {
        let (controller, project_id) = setup(echo_registry()).await?;
        let run = controller.start_run(project_id).await?;
        let run = controller.wait_for_run(run.id, Duration::from_secs(5)).await?;
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.ended_at.is_some());

        let tasks = controller.run_tasks(run.id).await?;
        let roles: Vec<&str> = tasks.iter().map(|t| t.agent_role.as_str()).collect();
        assert_eq!(roles, vec!["PM", "SA", "PG", "QA"]);
        assert_eq!(tasks[0].input_context["description"], json!("A todo app"));
        assert_eq!(tasks[3].input_context["last"], json!("PG"));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_run_errors_are_synchronous() -> Result<()> {
        let (controller, project_id) = setup(echo_registry()).await?;
        assert!(matches!(
            controller.start_run(project_id + 100).await,
            Err(EngineError::ProjectNotFound { .. })
        ));

        let db = controller.inner.db.clone();
        let bad = WorkflowGraph {
            nodes: vec![Node::new("pm", AgentRole::Pm, "")],
            edges: vec![],
        };
        db.call(move |db| db.save_workflow(project_id, &bad)).await?;
        let err = controller.start_run(project_id).await.unwrap_err();
        assert!(matches!(err, EngineError::Graph(_)));
        assert!(controller.list_runs(project_id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_workflow() -> Result<()> {
        let (controller, _) = setup(echo_registry()).await?;
        let db = controller.inner.db.clone();
        let other = db.call(|db| db.create_project("beta", "")).await?;
        assert!(matches!(
            controller.start_run(other.id).await,
            Err(EngineError::WorkflowNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_requires_finished_run() -> Result<()> {
        let (controller, project_id) = setup(echo_registry()).await?;
        assert!(matches!(
            controller.resume_run(42).await,
            Err(EngineError::RunNotFound { id: 42 })
        ));

        let run = controller.start_run(project_id).await?;
        controller.wait_for_run(run.id, Duration::from_secs(5)).await?;
        assert_eq!(
            controller.resume_run(run.id).await?,
            ResumeOutcome::NothingToResume
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_recovery_leaves_live_runs_alone() -> Result<()> {
        let gate = Arc::new(tokio::sync::Notify::new());
        let (owner, project_id) = setup(gated_registry(gate.clone())).await?;
        let run = owner.start_run(project_id).await?;
        assert_eq!(run.owner.as_deref(), Some(owner.owner()));

        // Another engine on the same database sees a fresh heartbeat
        let other = controller_on(owner.inner.db.clone(), echo_registry());
        assert_ne!(other.owner(), owner.owner());
        assert!(other.recover_interrupted_runs().await?.is_empty());

        // The owner never reclaims its own run, even with an old heartbeat
        let run_id = run.id;
        owner
            .inner
            .db
            .call(move |db| db.heartbeat_runs(&[run_id], "2000-01-01T00:00:00+00:00"))
            .await?;
        assert!(owner.recover_interrupted_runs().await?.is_empty());
        assert_eq!(owner.get_run(run.id).await?.status, RunStatus::Running);

        gate.notify_one();
        let run = owner.wait_for_run(run.id, Duration::from_secs(5)).await?;
        assert_eq!(run.status, RunStatus::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_continuation_fails_run_and_open_tasks() -> Result<()> {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = CapabilityRegistry::builder();
        for role in AgentRole::required() {
            let calls = calls.clone();
            builder = builder.register_fn(role, move |_ctx| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 4 {
                        anyhow::bail!("warming up");
                    }
                    Ok(ContextMap::new())
                }
            });
        }
        let (controller, project_id) = setup(Arc::new(builder.build())).await?;
        let run = controller.start_run(project_id).await?;
        let run = controller.wait_for_run(run.id, Duration::from_secs(5)).await?;
        assert_eq!(run.status, RunStatus::Fail);
        let failed = controller.run_tasks(run.id).await?[0].clone();

        // The retried task succeeds but the rest of the run cannot be planned
        let bad = WorkflowGraph {
            nodes: vec![Node::new("pm", AgentRole::Pm, "Plan")],
            edges: vec![],
        };
        controller
            .inner
            .db
            .call(move |db| db.save_workflow(project_id, &bad))
            .await?;
        controller.retry_task(failed.id).await?;
        controller.wait_idle().await;

        let run = controller.get_run(run.id).await?;
        assert_eq!(run.status, RunStatus::Fail);
        assert!(run.error.unwrap_or_default().contains("SA"));
        assert_eq!(controller.get_task(failed.id).await?.status, TaskStatus::Success);
        assert!(controller.inner.owned_runs().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_failure_exhausts_retries() -> Result<()> {
        // No plugins and an LLM that always fails.
        let (controller, project_id) = setup(Arc::new(CapabilityRegistry::empty())).await?;
        let run = controller.start_run(project_id).await?;
        let run = controller.wait_for_run(run.id, Duration::from_secs(5)).await?;
        assert_eq!(run.status, RunStatus::Fail);
        assert!(run.error.unwrap_or_default().contains("failed permanently"));

        let tasks = controller.run_tasks(run.id).await?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Fail);
        assert_eq!(tasks[0].attempt_history.len(), 3);
        assert!(
            tasks[0]
                .error_details
                .as_deref()
                .unwrap_or_default()
                .contains("no model configured")
        );
        Ok(())
    }
}
