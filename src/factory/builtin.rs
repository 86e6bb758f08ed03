//! Plugin shipped with the engine: LLM-backed PM and SA capabilities.
//!
//! Both follow the same steps as the legacy path (render the role's prompt,
//! call the model, parse a JSON object) but validate their inputs first and
//! report plugin-specific progress. PG and QA stay on the legacy path.
//!
//! `[plugins]` keys read by `initialize`:
//!
//! | Key             | Meaning                                       |
//! |-----------------|-----------------------------------------------|
//! | `builtin.roles` | comma-separated subset of `PM,SA` to serve    |

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use super::capability::{Capability, Plugin, TaskContext};
use super::llm::{parse_json_object, prompt_template, render_prompt};
use super::models::{AgentRole, ContextMap};

pub const PLUGIN_NAME: &str = "builtin";
pub const ROLES_KEY: &str = "builtin.roles";

#[derive(Default)]
pub struct BuiltinPlugin {
    roles: OnceLock<Vec<AgentRole>>,
}

impl BuiltinPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn served_roles(&self) -> Vec<AgentRole> {
        self.roles
            .get()
            .cloned()
            .unwrap_or_else(|| vec![AgentRole::Pm, AgentRole::Sa])
    }
}

fn parse_roles(raw: &str) -> anyhow::Result<Vec<AgentRole>> {
    let mut roles = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let role: AgentRole = part.parse().map_err(anyhow::Error::msg)?;
        if !matches!(role, AgentRole::Pm | AgentRole::Sa) {
            anyhow::bail!("{} only serves PM and SA, not {}", ROLES_KEY, role);
        }
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    Ok(roles)
}

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn initialize(&self, config: &HashMap<String, String>) -> anyhow::Result<()> {
        let roles = match config.get(ROLES_KEY) {
            Some(raw) => parse_roles(raw)?,
            None => vec![AgentRole::Pm, AgentRole::Sa],
        };
        info!(roles = ?roles, "Initializing builtin plugin");
        // A second initialize keeps the first role set
        let _ = self.roles.set(roles);
        Ok(())
    }

    fn teardown(&self) -> anyhow::Result<()> {
        info!("Tearing down builtin plugin");
        Ok(())
    }

    fn capabilities(&self) -> Vec<(AgentRole, Arc<dyn Capability>)> {
        self.served_roles()
            .into_iter()
            .map(|role| {
                let capability: Arc<dyn Capability> = match role {
                    AgentRole::Sa => Arc::new(SaCapability),
                    _ => Arc::new(PmCapability),
                };
                (role, capability)
            })
            .collect()
    }
}

/// Shared body of the two capabilities once inputs are validated.
async fn generate(ctx: &TaskContext, role: &AgentRole, asking: &str, parsing: &str) -> anyhow::Result<ContextMap> {
    let template = prompt_template(role).context("No prompt template for role")?;
    let prompt = render_prompt(template, ctx.inputs())?;
    ctx.update_progress(20, asking).await;
    let reply = ctx.llm().generate(&prompt).await?;
    ctx.update_progress(80, parsing).await;
    parse_json_object(&reply)
}

/// Turns the project description into requirements and user stories.
pub struct PmCapability;

#[async_trait]
impl Capability for PmCapability {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<ContextMap> {
        ctx.update_progress(10, "PM Plugin: Validating inputs...").await;
        ctx.require_input("description")?;
        generate(
            &ctx,
            &AgentRole::Pm,
            "PM Plugin: Generating requirements with AI...",
            "PM Plugin: Parsing generated requirements...",
        )
        .await
        .context("Failed to generate or parse requirements")
    }
}

/// Turns requirements into an architecture and API design.
pub struct SaCapability;

#[async_trait]
impl Capability for SaCapability {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<ContextMap> {
        ctx.update_progress(10, "SA Plugin: Analyzing requirements...").await;
        generate(
            &ctx,
            &AgentRole::Sa,
            "SA Plugin: Designing system architecture with AI...",
            "SA Plugin: Parsing architecture design...",
        )
        .await
        .context("Failed to generate or parse system architecture")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::capability::{CapabilityDispatcher, CapabilityRegistry, Resolution};
    use crate::factory::db::{DbHandle, FactoryDb};
    use crate::factory::events::BroadcastSink;
    use crate::factory::llm::LlmClient;
    use crate::factory::models::{NewTask, RetrySettings};
    use crate::factory::task_store::TaskStore;
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingLlm {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl RecordingLlm {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for RecordingLlm {
        async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.reply == "fail" {
                anyhow::bail!("model unavailable");
            }
            Ok(self.reply.clone())
        }
    }

    async fn setup(
        plugin_config: HashMap<String, String>,
        llm: Arc<RecordingLlm>,
    ) -> Result<(CapabilityDispatcher, TaskStore, i64)> {
        let db = DbHandle::new(FactoryDb::new_in_memory()?);
        let project = db.call(|db| db.create_project("shop", "")).await?;
        let store = TaskStore::new(db, Arc::new(BroadcastSink::default()));
        let task = store
            .create_task(NewTask {
                run_id: None,
                project_id: project.id,
                node_id: None,
                agent_role: AgentRole::Pm,
                task_name: "Plan".to_string(),
                input_context: ContextMap::new(),
                retry: RetrySettings::default(),
            })
            .await?;
        store.start(task.id).await?;
        let registry = CapabilityRegistry::builder()
            .with_plugin_config(plugin_config)
            .register_plugin(Arc::new(BuiltinPlugin::new()))
            .build();
        let dispatcher = CapabilityDispatcher::new(Arc::new(registry), llm, store.clone());
        Ok((dispatcher, store, task.id))
    }

    fn described(text: &str) -> ContextMap {
        let mut inputs = ContextMap::new();
        inputs.insert("description".into(), json!(text));
        inputs
    }

    #[tokio::test]
    async fn test_pm_generates_requirements() -> Result<()> {
        let llm = RecordingLlm::new("```json\n{\"summary\": \"Test summary\", \"requirements\": []}\n```");
        let (dispatcher, store, task_id) = setup(HashMap::new(), llm.clone()).await?;

        let result = dispatcher
            .execute(task_id, &AgentRole::Pm, described("A simple e-commerce app"))
            .await?;
        assert_eq!(result["summary"], json!("Test summary"));
        assert!(llm.prompts.lock().unwrap()[0].contains("A simple e-commerce app"));
        assert_eq!(store.get(task_id).await?.progress_pct, 80);
        Ok(())
    }

    #[tokio::test]
    async fn test_pm_requires_description() -> Result<()> {
        let llm = RecordingLlm::new("{}");
        let (dispatcher, _store, task_id) = setup(HashMap::new(), llm.clone()).await?;

        let err = dispatcher
            .execute(task_id, &AgentRole::Pm, ContextMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.role, "PM");
        assert!(err.message.contains("Missing required input: description"));
        assert!(llm.prompts.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_sa_wraps_model_failure() -> Result<()> {
        let (dispatcher, _store, task_id) = setup(HashMap::new(), RecordingLlm::new("fail")).await?;
        let err = dispatcher
            .execute(task_id, &AgentRole::Sa, described("anything"))
            .await
            .unwrap_err();
        assert!(err.message.contains("Failed to generate or parse system architecture"));
        assert!(err.message.contains("model unavailable"));
        Ok(())
    }

    #[tokio::test]
    async fn test_sa_unparseable_reply() -> Result<()> {
        let (dispatcher, _store, task_id) =
            setup(HashMap::new(), RecordingLlm::new("no json here")).await?;
        let err = dispatcher
            .execute(task_id, &AgentRole::Sa, ContextMap::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("Failed to parse LLM response"));
        Ok(())
    }

    #[test]
    fn test_roles_config_limits_capabilities() {
        let config = HashMap::from([(ROLES_KEY.to_string(), "sa".to_string())]);
        let registry = CapabilityRegistry::builder()
            .with_plugin_config(config)
            .register_plugin(Arc::new(BuiltinPlugin::new()))
            .build();
        assert!(matches!(registry.resolve(&AgentRole::Sa), Resolution::Plugin(_)));
        assert!(matches!(registry.resolve(&AgentRole::Pm), Resolution::Legacy(_)));
        assert!(matches!(registry.resolve(&AgentRole::Pg), Resolution::Legacy(_)));
        assert_eq!(registry.plugin_names(), vec![PLUGIN_NAME]);
    }

    #[test]
    fn test_invalid_roles_config_skips_plugin() {
        let config = HashMap::from([(ROLES_KEY.to_string(), "PM,QA".to_string())]);
        let registry = CapabilityRegistry::builder()
            .with_plugin_config(config)
            .register_plugin(Arc::new(BuiltinPlugin::new()))
            .build();
        assert!(registry.plugin_names().is_empty());
        assert!(matches!(registry.resolve(&AgentRole::Pm), Resolution::Legacy(_)));
    }

    #[test]
    fn test_parse_roles() {
        assert_eq!(parse_roles("PM, sa,PM").unwrap(), vec![AgentRole::Pm, AgentRole::Sa]);
        assert!(parse_roles("").unwrap().is_empty());
        assert!(parse_roles("PG").is_err());
        assert!(parse_roles("P M").is_err());
    }
}
