//! Role → capability resolution and isolated invocation.
//!
//! A `CapabilityRegistry` is assembled once at start-up from plugins and
//! inline closures, then shared read-only behind an `Arc`. The
//! `CapabilityDispatcher` resolves a role against it:
//!
//! | Resolution   | Executes                                             |
//! |--------------|------------------------------------------------------|
//! | `Plugin`     | the registered `Capability`                          |
//! | `Legacy`     | built-in prompt template + `LlmClient::generate`     |
//! | `Unresolved` | nothing; custom role without a plugin is an error    |
//!
//! Whatever goes wrong inside a capability (error, panic, timeout, bad JSON)
//! comes out as a `CapabilityError`. The dispatcher never retries.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, info, warn};

use super::llm::{LlmClient, parse_json_object, prompt_template, render_prompt};
use super::models::{AgentRole, ContextMap};
use super::task_store::TaskStore;
use crate::errors::CapabilityError;

pub const PLUGIN_FALLBACK_SUMMARY: &str = "Task completed via plugin.";
pub const LEGACY_FALLBACK_SUMMARY: &str = "Task completed successfully.";

/// Everything a capability may touch while executing one task.
#[derive(Clone)]
pub struct TaskContext {
    task_id: i64,
    role: AgentRole,
    inputs: ContextMap,
    llm: Arc<dyn LlmClient>,
    tasks: TaskStore,
}

impl TaskContext {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn role(&self) -> &AgentRole {
        &self.role
    }

    /// Snapshot of the run context taken when the task was created.
    pub fn inputs(&self) -> &ContextMap {
        &self.inputs
    }

    /// Input `key`, or an error naming it when absent or null.
    pub fn require_input(&self, key: &str) -> anyhow::Result<&Value> {
        match self.inputs.get(key) {
            Some(Value::Null) | None => anyhow::bail!("Missing required input: {}", key),
            Some(value) => Ok(value),
        }
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// Report progress. Failures are logged, never returned.
    pub async fn update_progress(&self, pct: u8, message: &str) {
        if let Err(e) = self.tasks.update_progress(self.task_id, pct, message).await {
            warn!(task_id = self.task_id, error = %e, "Failed to record progress");
        }
    }

    /// Report an intermediate step. Failures are logged, never returned.
    pub async fn step_complete(&self, message: &str, payload: Option<Value>) {
        if let Err(e) = self.tasks.step_complete(self.task_id, message, payload).await {
            warn!(task_id = self.task_id, error = %e, "Failed to record step");
        }
    }
}

/// Pluggable implementation of one role's work.
///
/// The returned map should contain a `summary` entry.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<ContextMap>;
}

/// Adapter turning an async closure into a `Capability`.
pub struct FnCapability<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ContextMap>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<ContextMap> {
        (self.f)(ctx).await
    }
}

pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ContextMap>> + Send + 'static,
{
    Arc::new(FnCapability { f })
}

/// A bundle of capabilities discovered at start-up.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Called once before the plugin's capabilities are registered. An error
    /// keeps the plugin out of the registry without affecting other plugins.
    fn initialize(&self, _config: &HashMap<String, String>) -> anyhow::Result<()> {
        Ok(())
    }

    fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn capabilities(&self) -> Vec<(AgentRole, Arc<dyn Capability>)>;
}

struct Registered {
    source: String,
    capability: Arc<dyn Capability>,
}

/// Outcome of looking a role up in the registry.
pub enum Resolution {
    Plugin(Arc<dyn Capability>),
    Legacy(&'static str),
    Unresolved,
}

#[derive(Default)]
pub struct RegistryBuilder {
    config: HashMap<String, String>,
    capabilities: HashMap<AgentRole, Registered>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration handed to every plugin's `initialize`.
    pub fn with_plugin_config(mut self, config: HashMap<String, String>) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, role: AgentRole, capability: Arc<dyn Capability>) -> Self {
        self.insert(role, "inline", capability);
        self
    }

    pub fn register_fn<F, Fut>(self, role: AgentRole, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ContextMap>> + Send + 'static,
    {
        self.register(role, capability_fn(f))
    }

    pub fn register_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        info!(plugin = plugin.name(), version = plugin.version(), "Loading plugin");
        if let Err(e) = plugin.initialize(&self.config) {
            error!(plugin = plugin.name(), error = %format!("{:#}", e), "Failed to initialize plugin");
            return self;
        }
        for (role, capability) in plugin.capabilities() {
            self.insert(role, plugin.name(), capability);
        }
        self.plugins.push(plugin);
        self
    }

    fn insert(&mut self, role: AgentRole, source: &str, capability: Arc<dyn Capability>) {
        if let Some(previous) = self.capabilities.get(&role) {
            warn!(
                role = %role,
                previous = %previous.source,
                replacement = source,
                "Capability already registered, overwriting"
            );
        }
        self.capabilities.insert(
            role,
            Registered {
                source: source.to_string(),
                capability,
            },
        );
    }

    pub fn build(self) -> CapabilityRegistry {
        info!(
            plugins = self.plugins.len(),
            capabilities = self.capabilities.len(),
            "Capability registry ready"
        );
        CapabilityRegistry {
            capabilities: self.capabilities,
            plugins: self.plugins,
        }
    }
}

/// Immutable role → capability map.
pub struct CapabilityRegistry {
    capabilities: HashMap<AgentRole, Registered>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registry with no plugins: every built-in role takes the legacy path.
    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    pub fn has_capability(&self, role: &AgentRole) -> bool {
        self.capabilities.contains_key(role)
    }

    pub fn resolve(&self, role: &AgentRole) -> Resolution {
        if let Some(registered) = self.capabilities.get(role) {
            return Resolution::Plugin(registered.capability.clone());
        }
        match prompt_template(role) {
            Some(template) => Resolution::Legacy(template),
            None => Resolution::Unresolved,
        }
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Tear down every loaded plugin, logging failures.
    pub fn teardown(&self) {
        for plugin in &self.plugins {
            match plugin.teardown() {
                Ok(()) => info!(plugin = plugin.name(), "Plugin torn down"),
                Err(e) => error!(plugin = plugin.name(), error = %format!("{:#}", e), "Failed to tear down plugin"),
            }
        }
    }
}

#[derive(Clone)]
pub struct CapabilityDispatcher {
    registry: Arc<CapabilityRegistry>,
    llm: Arc<dyn LlmClient>,
    tasks: TaskStore,
    timeout: Option<Duration>,
}

impl CapabilityDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>, llm: Arc<dyn LlmClient>, tasks: TaskStore) -> Self {
        Self {
            registry,
            llm,
            tasks,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute `role` for task `task_id` with `inputs` as its context.
    ///
    /// The returned map always has a `summary` entry.
    pub async fn execute(
        &self,
        task_id: i64,
        role: &AgentRole,
        inputs: ContextMap,
    ) -> Result<ContextMap, CapabilityError> {
        let ctx = TaskContext {
            task_id,
            role: role.clone(),
            inputs,
            llm: self.llm.clone(),
            tasks: self.tasks.clone(),
        };

        let (work, fallback_summary): (BoxFuture<'static, anyhow::Result<ContextMap>>, &str) =
            match self.registry.resolve(role) {
                Resolution::Plugin(capability) => (
                    async move { capability.execute(ctx).await }.boxed(),
                    PLUGIN_FALLBACK_SUMMARY,
                ),
                Resolution::Legacy(template) => {
                    (run_legacy(template, ctx).boxed(), LEGACY_FALLBACK_SUMMARY)
                }
                Resolution::Unresolved => {
                    return Err(self.reject(
                        task_id,
                        role,
                        "No capability registered for role".to_string(),
                    ));
                }
            };

        let guarded = AssertUnwindSafe(work).catch_unwind();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(self.reject(
                        task_id,
                        role,
                        format!("Timed out after {}s", limit.as_secs_f64()),
                    ));
                }
            },
            None => guarded.await,
        };

        match outcome {
            Ok(Ok(mut result)) => {
                ensure_summary(&mut result, fallback_summary);
                Ok(result)
            }
            Ok(Err(e)) => Err(self.reject(task_id, role, format!("{:#}", e))),
            Err(panic) => Err(self.reject(
                task_id,
                role,
                format!("Capability panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    }

    fn reject(&self, task_id: i64, role: &AgentRole, message: String) -> CapabilityError {
        warn!(task_id, role = %role, error = %message, "Capability execution failed");
        CapabilityError::new(role.as_str(), message)
    }
}

/// Built-in path: fill the role's prompt template, ask the LLM, parse JSON.
async fn run_legacy(template: &'static str, ctx: TaskContext) -> anyhow::Result<ContextMap> {
    ctx.update_progress(20, "Analyzing requirements with AI...").await;
    let prompt = render_prompt(template, ctx.inputs())?;
    let reply = ctx.llm().generate(&prompt).await?;
    ctx.update_progress(80, "AI processing complete. Parsing results...")
        .await;
    parse_json_object(&reply)
}

fn ensure_summary(result: &mut ContextMap, fallback: &str) {
    let missing = match result.get("summary") {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if missing {
        result.insert("summary".to_string(), Value::String(fallback.to_string()));
    }
}

/// Human-readable summary of a capability result.
pub fn summary_of(result: &ContextMap) -> String {
    match result.get("summary") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
