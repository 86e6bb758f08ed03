//! Task persistence and lifecycle transitions.
//!
//! `TaskStore` is the only writer of agent task records. Every mutation
//! reads, checks and writes the task inside a single `DbHandle::call`, then
//! publishes exactly one `TaskEvent` describing the new state.
//!
//! ```text
//! PENDING ──start──> RUNNING ──complete──> SUCCESS
//!                      │  ├───fail──────> FAIL ──begin_manual_retry──> RUNNING
//!                      │  └─mark_retry_wait─> RETRY_WAIT ──start──> RUNNING
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::db::DbHandle;
use super::events::{EventSink, task_topic};
use super::models::*;
use crate::errors::EngineError;

#[derive(Clone)]
pub struct TaskStore {
    db: DbHandle,
    sink: Arc<dyn EventSink>,
}

impl TaskStore {
    pub fn new(db: DbHandle, sink: Arc<dyn EventSink>) -> Self {
        Self { db, sink }
    }

    /// Insert a PENDING task and emit QUEUED.
    pub async fn create_task(&self, new: NewTask) -> Result<AgentTask, EngineError> {
        let task = self
            .db
            .call(move |db| db.create_agent_task(&new))
            .await
            .map_err(EngineError::Database)?;
        debug!(task_id = task.id, run_id = ?task.run_id, role = %task.agent_role, "Task created");
        self.emit(TaskEvent::for_task(
            TaskEventType::Queued,
            &task,
            format!("Task '{}' queued", task.task_name),
        ));
        Ok(task)
    }

    /// PENDING or RETRY_WAIT → RUNNING. Emits RUNNING.
    pub async fn start(&self, task_id: i64) -> Result<AgentTask, EngineError> {
        let task = self
            .transition(task_id, move |task| {
                guard(task, &[TaskStatus::Pending, TaskStatus::RetryWait], TaskStatus::Running)?;
                task.status = TaskStatus::Running;
                task.progress_pct = 0;
                task.started_at = Some(now_timestamp());
                task.completed_at = None;
                let line = format!("Started attempt {}", task.retry_count + 1);
                append_log(task, &line);
                Ok(())
            })
            .await?;
        self.emit(TaskEvent::for_task(
            TaskEventType::Running,
            &task,
            format!("Task '{}' started", task.task_name),
        ));
        Ok(task)
    }

    /// User-initiated FAIL (or RETRY_WAIT) → RUNNING, bypassing RETRY_WAIT.
    ///
    /// Rejected with `ConcurrentModification` when the task is already
    /// RUNNING, which is what keeps overlapping retry triggers from running
    /// the same task twice.
    pub async fn begin_manual_retry(&self, task_id: i64) -> Result<AgentTask, EngineError> {
        let task = self
            .transition(task_id, move |task| {
                guard(task, &[TaskStatus::Fail, TaskStatus::RetryWait], TaskStatus::Running)?;
                task.status = TaskStatus::Running;
                task.progress_pct = 0;
                task.started_at = Some(now_timestamp());
                task.completed_at = None;
                append_log(task, "Manual retry requested");
                Ok(())
            })
            .await?;
        self.emit(TaskEvent::for_task(
            TaskEventType::Running,
            &task,
            format!("Task '{}' restarted manually", task.task_name),
        ));
        Ok(task)
    }

    /// Record progress of a RUNNING task. `pct` is clamped to 100.
    pub async fn update_progress(
        &self,
        task_id: i64,
        pct: u8,
        message: &str,
    ) -> Result<AgentTask, EngineError> {
        let message = message.to_string();
        let line = message.clone();
        let task = self
            .transition(task_id, move |task| {
                guard(task, &[TaskStatus::Running], TaskStatus::Running)?;
                task.progress_pct = pct.min(100);
                if !line.is_empty() {
                    append_log(task, &line);
                }
                Ok(())
            })
            .await?;
        self.emit(TaskEvent::for_task(TaskEventType::Progress, &task, message));
        Ok(task)
    }

    /// Record an intermediate step of a RUNNING task. Emits STEP_COMPLETE.
    pub async fn step_complete(
        &self,
        task_id: i64,
        message: &str,
        payload: Option<Value>,
    ) -> Result<AgentTask, EngineError> {
        let message = message.to_string();
        let line = message.clone();
        let task = self
            .transition(task_id, move |task| {
                guard(task, &[TaskStatus::Running], TaskStatus::Running)?;
                append_log(task, &line);
                Ok(())
            })
            .await?;
        let mut event = TaskEvent::for_task(TaskEventType::StepComplete, &task, message);
        if let Some(payload) = payload {
            event = event.with_payload(payload);
        }
        self.emit(event);
        Ok(task)
    }

    /// RUNNING → SUCCESS with the capability's result. Emits COMPLETED.
    pub async fn complete(
        &self,
        task_id: i64,
        result: ContextMap,
        summary: &str,
    ) -> Result<AgentTask, EngineError> {
        let summary = summary.to_string();
        let line = format!("Completed: {}", summary);
        let task = self
            .transition(task_id, move |task| {
                guard(task, &[TaskStatus::Running], TaskStatus::Success)?;
                task.status = TaskStatus::Success;
                task.progress_pct = 100;
                task.result_context = Some(result);
                task.completed_at = Some(now_timestamp());
                append_log(task, &line);
                Ok(())
            })
            .await?;
        let payload = task
            .result_context
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Null);
        self.emit(TaskEvent::for_task(TaskEventType::Completed, &task, summary).with_payload(payload));
        Ok(task)
    }

    /// → FAIL, keeping `error` in `error_details`. Emits FAILED.
    pub async fn fail(&self, task_id: i64, error: &str) -> Result<AgentTask, EngineError> {
        let error = error.to_string();
        let details = error.clone();
        let task = self
            .transition(task_id, move |task| {
                guard(
                    task,
                    &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::RetryWait],
                    TaskStatus::Fail,
                )?;
                task.status = TaskStatus::Fail;
                task.completed_at = Some(now_timestamp());
                append_log(task, &format!("Failed: {}", details));
                task.error_details = Some(details);
                Ok(())
            })
            .await?;
        self.emit(TaskEvent::for_task(TaskEventType::Failed, &task, error));
        Ok(task)
    }

    /// RUNNING → RETRY_WAIT, recording the failed attempt. Emits
    /// RETRY_SCHEDULED.
    pub async fn mark_retry_wait(
        &self,
        task_id: i64,
        attempt: u32,
        error: &str,
        next_delay: Duration,
    ) -> Result<AgentTask, EngineError> {
        let error = error.to_string();
        let task = self
            .transition(task_id, move |task| {
                guard(task, &[TaskStatus::Running], TaskStatus::RetryWait)?;
                task.status = TaskStatus::RetryWait;
                task.retry_count = attempt;
                task.attempt_history.push(AttemptRecord {
                    timestamp: now_timestamp(),
                    attempt,
                    error: error.clone(),
                });
                append_log(
                    task,
                    &format!(
                        "Attempt {} failed: {}. Retrying in {}ms",
                        attempt,
                        error,
                        next_delay.as_millis()
                    ),
                );
                task.error_details = Some(error);
                Ok(())
            })
            .await?;
        let message = format!(
            "Retry {}/{} scheduled in {:.1}s",
            attempt,
            task.max_retries,
            next_delay.as_secs_f64()
        );
        let payload = json!({
            "attempt": attempt,
            "max_retries": task.max_retries,
            "delay_ms": next_delay.as_millis() as u64,
            "error": task.error_details,
        });
        self.emit(TaskEvent::for_task(TaskEventType::RetryScheduled, &task, message).with_payload(payload));
        Ok(task)
    }

    pub async fn get(&self, task_id: i64) -> Result<AgentTask, EngineError> {
        self.db
            .call(move |db| db.get_agent_task(task_id))
            .await
            .map_err(EngineError::Database)?
            .ok_or(EngineError::TaskNotFound { id: task_id })
    }

    /// Tasks of a run in creation order.
    pub async fn list_run_tasks(&self, run_id: i64) -> Result<Vec<AgentTask>, EngineError> {
        self.db
            .call(move |db| db.list_run_tasks(run_id))
            .await
            .map_err(EngineError::Database)
    }

    /// Load, mutate and store a task while holding the database lock.
    async fn transition<F>(&self, task_id: i64, mutate: F) -> Result<AgentTask, EngineError>
    where
        F: FnOnce(&mut AgentTask) -> Result<(), EngineError> + Send + 'static,
    {
        self.db
            .call(move |db| {
                let Some(mut task) = db.get_agent_task(task_id)? else {
                    return Ok(Err(EngineError::TaskNotFound { id: task_id }));
                };
                if let Err(e) = mutate(&mut task) {
                    return Ok(Err(e));
                }
                db.update_agent_task(&task)?;
                Ok(Ok(task))
            })
            .await
            .map_err(EngineError::Database)?
    }

    fn emit(&self, event: TaskEvent) {
        let topic = task_topic(event.project_id);
        if let Err(e) = self.sink.publish(&topic, &event) {
            warn!(
                task_id = event.task_id,
                event = %event.event_type,
                error = %e,
                "Failed to publish task event"
            );
        }
    }
}

fn guard(task: &AgentTask, allowed: &[TaskStatus], to: TaskStatus) -> Result<(), EngineError> {
    if allowed.contains(&task.status) {
        return Ok(());
    }
    if task.status == TaskStatus::Running && to == TaskStatus::Running {
        return Err(EngineError::ConcurrentModification { task_id: task.id });
    }
    Err(EngineError::InvalidTransition {
        task_id: task.id,
        from: task.status.to_string(),
        to: to.to_string(),
    })
}

fn append_log(task: &mut AgentTask, line: &str) {
    task.log_content
        .push_str(&format!("[{}] {}\n", now_timestamp(), line));
}
