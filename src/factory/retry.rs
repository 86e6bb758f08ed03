//! Automatic retry with exponential backoff.
//!
//! On a capability failure the controller either parks the task in
//! RETRY_WAIT and reports when to try again, or fails it permanently. It
//! never blocks a worker while waiting: the caller hands the continuation to
//! `schedule`, which arms a timer on the worker pool.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use super::models::AgentTask;
use super::pool::WorkerPool;
use super::task_store::TaskStore;
use crate::errors::{CapabilityError, EngineError};

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before retry `attempt` (1-based): `initial * factor^(attempt-1)`,
/// capped at `MAX_BACKOFF`.
pub fn backoff_delay(initial_delay_seconds: u32, backoff_factor: f64, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let secs = initial_delay_seconds as f64 * backoff_factor.powi(exponent);
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Engine-wide knobs applied on top of each task's own retry settings.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Replaces the computed backoff when set. Used by tests and dev mode.
    pub delay_override: Option<Duration>,
}

impl RetryPolicy {
    pub fn with_delay_override(delay: Duration) -> Self {
        Self {
            delay_override: Some(delay),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Task is in RETRY_WAIT; run the continuation after `effective_delay`.
    Scheduled {
        attempt: u32,
        delay: Duration,
        effective_delay: Duration,
    },
    /// Task is in FAIL.
    PermanentFailure { attempts: u32 },
}

#[derive(Clone)]
pub struct RetryController {
    tasks: TaskStore,
    pool: WorkerPool,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(tasks: TaskStore, pool: WorkerPool, policy: RetryPolicy) -> Self {
        Self {
            tasks,
            pool,
            policy,
        }
    }

    /// Record a failed attempt of a RUNNING task and decide what happens next.
    pub async fn on_failure(
        &self,
        task: &AgentTask,
        error: &CapabilityError,
    ) -> Result<RetryDecision, EngineError> {
        let message = error.to_string();

        if !task.can_retry() {
            warn!(
                task_id = task.id,
                attempts = task.retry_count,
                retryable = task.is_retryable,
                error = %message,
                "Task failed permanently"
            );
            self.tasks.fail(task.id, &message).await?;
            return Ok(RetryDecision::PermanentFailure {
                attempts: task.retry_count,
            });
        }

        let attempt = task.retry_count + 1;
        let delay = backoff_delay(task.initial_delay_seconds, task.backoff_factor, attempt);
        let effective_delay = self.policy.delay_override.unwrap_or(delay);
        self.tasks
            .mark_retry_wait(task.id, attempt, &message, effective_delay)
            .await?;
        info!(
            task_id = task.id,
            attempt,
            max_retries = task.max_retries,
            delay_ms = effective_delay.as_millis() as u64,
            error = %message,
            "Retry scheduled"
        );
        Ok(RetryDecision::Scheduled {
            attempt,
            delay,
            effective_delay,
        })
    }

    /// Arm a timer that runs `job` on the worker pool after `delay`.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.submit_after(delay, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::db::{DbHandle, FactoryDb};
    use crate::factory::events::BroadcastSink;
    use crate::factory::models::{AgentRole, ContextMap, NewTask, RetrySettings, TaskStatus};
    use anyhow::Result;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(backoff_delay(5, 2.0, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(5, 2.0, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(5, 2.0, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(3, 1.0, 4), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_degenerate_inputs() {
        assert_eq!(backoff_delay(0, 2.0, 3), Duration::ZERO);
        assert_eq!(backoff_delay(5, -1.0, 2), Duration::ZERO);
        assert_eq!(backoff_delay(5, 2.0, 0), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_is_capped_instead_of_overflowing() {
        assert_eq!(backoff_delay(5, 1e12, 3), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX, f64::MAX, u32::MAX), MAX_BACKOFF);
        assert_eq!(backoff_delay(5, f64::INFINITY, 2), MAX_BACKOFF);
        assert_eq!(backoff_delay(5, f64::NAN, 2), Duration::ZERO);
        assert_eq!(backoff_delay(60 * 60, 2.0, 6), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_huge_backoff_factor_still_schedules() -> Result<()> {
        let retry = RetrySettings {
            backoff_factor: 1e12,
            ..RetrySettings::default()
        };
        let (controller, store, task) = setup(RetryPolicy::default(), retry).await?;
        controller.on_failure(&task, &err()).await?;
        let task = store.start(task.id).await?;
        controller.on_failure(&task, &err()).await?;
        let task = store.start(task.id).await?;

        let decision = controller.on_failure(&task, &err()).await?;
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                attempt: 3,
                delay: MAX_BACKOFF,
                effective_delay: MAX_BACKOFF,
            }
        );
        assert_eq!(store.get(task.id).await?.status, TaskStatus::RetryWait);
        Ok(())
    }

    async fn setup(policy: RetryPolicy, retry: RetrySettings) -> Result<(RetryController, TaskStore, AgentTask)> {
        let db = DbHandle::new(FactoryDb::new_in_memory()?);
        let project = db.call(|db| db.create_project("alpha", "")).await?;
        let store = TaskStore::new(db, Arc::new(BroadcastSink::default()));
        let task = store
            .create_task(NewTask {
                run_id: None,
                project_id: project.id,
                node_id: None,
                agent_role: AgentRole::Sa,
                task_name: "Design".to_string(),
                input_context: ContextMap::new(),
                retry,
            })
            .await?;
        let task = store.start(task.id).await?;
        let controller = RetryController::new(store.clone(), WorkerPool::new(1), policy);
        Ok((controller, store, task))
    }

    fn err() -> CapabilityError {
        CapabilityError::new("SA", "model overloaded")
    }

    #[tokio::test]
    async fn test_first_failure_schedules_retry() -> Result<()> {
        let (controller, store, task) = setup(RetryPolicy::default(), RetrySettings::default()).await?;

        let decision = controller.on_failure(&task, &err()).await?;
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(5),
                effective_delay: Duration::from_secs(5),
            }
        );

        let stored = store.get(task.id).await?;
        assert_eq!(stored.status, TaskStatus::RetryWait);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_details.unwrap().contains("model overloaded"));
        Ok(())
    }

    #[tokio::test]
    async fn test_delay_override_applies() -> Result<()> {
        let policy = RetryPolicy::with_delay_override(Duration::from_millis(10));
        let (controller, _store, task) = setup(policy, RetrySettings::default()).await?;
        match controller.on_failure(&task, &err()).await? {
            RetryDecision::Scheduled {
                delay,
                effective_delay,
                ..
            } => {
                assert_eq!(delay, Duration::from_secs(5));
                assert_eq!(effective_delay, Duration::from_millis(10));
            }
            other => panic!("Expected a scheduled retry, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_budget_fails_task() -> Result<()> {
        let retry = RetrySettings {
            max_retries: 1,
            ..RetrySettings::default()
        };
        let policy = RetryPolicy::with_delay_override(Duration::ZERO);
        let (controller, store, task) = setup(policy, retry).await?;

        controller.on_failure(&task, &err()).await?;
        let task = store.start(task.id).await?;
        let decision = controller.on_failure(&task, &err()).await?;
        assert_eq!(decision, RetryDecision::PermanentFailure { attempts: 1 });

        let stored = store.get(task.id).await?;
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.attempt_history.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() -> Result<()> {
        let retry = RetrySettings {
            retryable: false,
            ..RetrySettings::default()
        };
        let (controller, store, task) = setup(RetryPolicy::default(), retry).await?;
        let decision = controller.on_failure(&task, &err()).await?;
        assert_eq!(decision, RetryDecision::PermanentFailure { attempts: 0 });
        assert_eq!(store.get(task.id).await?.status, TaskStatus::Fail);
        Ok(())
    }

    #[tokio::test]
    async fn test_schedule_runs_job_on_pool() -> Result<()> {
        let (controller, _store, _task) = setup(RetryPolicy::default(), RetrySettings::default()).await?;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        controller.schedule(Duration::from_millis(5), async move {
            flag.store(true, Ordering::SeqCst);
        });
        controller.pool.drain().await;
        assert!(fired.load(Ordering::SeqCst));
        Ok(())
    }
}
