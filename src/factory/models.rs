use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Accumulated key/value context threaded between the nodes of a run.
///
/// Insertion-ordered; a later write to an existing key replaces it in place.
pub type ContextMap = serde_json::Map<String, Value>;

/// Merge `update` into `base`, last writer wins on key collisions.
pub fn merge_context(base: &mut ContextMap, update: &ContextMap) {
    for (key, value) in update {
        base.insert(key.clone(), value.clone());
    }
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ── Agent roles ──────────────────────────────────────────────────────

/// Role identifier attached to a graph node.
///
/// The four built-in roles have legacy prompt templates; anything else must
/// be served by a registered plugin capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentRole {
    Pm,
    Sa,
    Pg,
    Qa,
    Custom(String),
}

impl AgentRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pm => "PM",
            Self::Sa => "SA",
            Self::Pg => "PG",
            Self::Qa => "QA",
            Self::Custom(name) => name,
        }
    }

    /// Roles every workflow graph has to contain.
    pub fn required() -> Vec<AgentRole> {
        vec![Self::Pm, Self::Sa, Self::Pg, Self::Qa]
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "PM" => Ok(Self::Pm),
            "SA" => Ok(Self::Sa),
            "PG" => Ok(Self::Pg),
            "QA" => Ok(Self::Qa),
            _ if !trimmed.is_empty()
                && trimmed
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
            {
                Ok(Self::Custom(trimmed.to_string()))
            }
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

impl TryFrom<String> for AgentRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgentRole> for String {
    fn from(role: AgentRole) -> Self {
        role.as_str().to_string()
    }
}

// ── Statuses ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Fail,
    RetryWait,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::RetryWait => "retry_wait",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            "retry_wait" => Ok(Self::RetryWait),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

// ── Projects and workflows ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: String,
}

/// One vertex of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(alias = "agentRole")]
    pub agent_role: AgentRole,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub data: ContextMap,
}

impl Node {
    pub fn new(id: &str, agent_role: AgentRole, label: &str) -> Self {
        Self {
            id: id.to_string(),
            agent_role,
            label: label.to_string(),
            data: ContextMap::new(),
        }
    }

    /// Name given to the task that executes this node.
    pub fn task_name(&self) -> String {
        if self.label.trim().is_empty() {
            self.agent_role.to_string()
        } else {
            self.label.clone()
        }
    }
}

/// Directed edge: `source_id` must run before `target_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "source", alias = "sourceId")]
    pub source_id: String,
    #[serde(alias = "target", alias = "targetId")]
    pub target_id: String,
}

impl Edge {
    pub fn new(source_id: &str, target_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        use anyhow::Context;
        serde_json::from_str(content).context("Failed to parse workflow graph JSON")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub project_id: i64,
    pub graph: WorkflowGraph,
    pub updated_at: String,
}

// ── Runs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub project_id: i64,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    /// Engine instance currently driving the run.
    pub owner: Option<String>,
    /// Last time the owner confirmed it is still alive.
    pub heartbeat_at: Option<String>,
}

// ── Agent tasks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub timestamp: String,
    pub attempt: u32,
    pub error: String,
}

/// Retry parameters stamped onto a task when it is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub initial_delay_seconds: u32,
    pub retryable: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            initial_delay_seconds: 5,
            retryable: true,
        }
    }
}

impl RetrySettings {
    /// Apply per-node overrides found in a node's `data` map.
    pub fn with_node_overrides(&self, data: &ContextMap) -> Self {
        let mut settings = self.clone();
        if let Some(v) = node_u32(data, "max_retries") {
            settings.max_retries = v;
        }
        if let Some(v) = data.get("backoff_factor").and_then(Value::as_f64) {
            settings.backoff_factor = v;
        }
        if let Some(v) = node_u32(data, "initial_delay_seconds") {
            settings.initial_delay_seconds = v;
        }
        if let Some(v) = data.get("retryable").and_then(Value::as_bool) {
            settings.retryable = v;
        }
        settings
    }
}

/// Unsigned override that fits in a `u32`; anything else is ignored.
fn node_u32(data: &ContextMap, key: &str) -> Option<u32> {
    let raw = data.get(key)?.as_u64()?;
    match u32::try_from(raw) {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "Node retry override out of range, ignoring");
            None
        }
    }
}

/// Parameters for `TaskStore::create_task`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub run_id: Option<i64>,
    pub project_id: i64,
    pub node_id: Option<String>,
    pub agent_role: AgentRole,
    pub task_name: String,
    pub input_context: ContextMap,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: i64,
    pub run_id: Option<i64>,
    pub project_id: i64,
    pub node_id: Option<String>,
    pub agent_role: AgentRole,
    pub task_name: String,
    pub status: TaskStatus,
    pub progress_pct: u8,
    pub input_context: ContextMap,
    pub result_context: Option<ContextMap>,
    pub log_content: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub initial_delay_seconds: u32,
    pub attempt_history: Vec<AttemptRecord>,
    pub is_retryable: bool,
    pub error_details: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl AgentTask {
    /// Whether another automatic retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.is_retryable && self.retry_count < self.max_retries
    }
}

// ── Task events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    Queued,
    Running,
    Progress,
    StepComplete,
    RetryScheduled,
    Completed,
    Failed,
}

impl TaskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Progress => "PROGRESS",
            Self::StepComplete => "STEP_COMPLETE",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification emitted on every task transition. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    pub project_id: i64,
    pub task_id: i64,
    pub task_name: String,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: String,
}

impl TaskEvent {
    pub fn for_task(event_type: TaskEventType, task: &AgentTask, message: impl Into<String>) -> Self {
        Self {
            event_type,
            project_id: task.project_id,
            task_id: task.id,
            task_name: task.task_name.clone(),
            progress: task.progress_pct,
            message: message.into(),
            payload: None,
            timestamp: now_timestamp(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
