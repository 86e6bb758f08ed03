use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::models::{AgentRole, ContextMap};

/// Generic text-in, text-out language model client.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// `LlmClient` that shells out to a CLI (e.g. `claude --print -p <prompt>`).
///
/// The prompt is appended as the last argument; stdout is the reply. The
/// child is killed when the returned future is dropped, e.g. on a capability
/// timeout.
#[derive(Debug, Clone)]
pub struct CommandLlmClient {
    command: String,
    args: Vec<String>,
}

impl CommandLlmClient {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl LlmClient for CommandLlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        debug!(command = %self.command, prompt_len = prompt.len(), "Calling LLM command");
        let output = Command::new(&self.command)
            .args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run LLM command '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "LLM command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

// ── Prompt templates ─────────────────────────────────────────────────

const PM_TEMPLATE: &str = r#"You are an experienced Project Manager.
Turn the project description below into concrete requirements.

Input:
{{input}}

Respond with JSON only:
{"summary": "...", "requirements": [{"id": "REQ-001", "title": "...", "description": "..."}], "userStories": [{"id": "US-001", "role": "...", "action": "...", "benefit": "..."}]}
"#;

const SA_TEMPLATE: &str = r#"You are a Software Architect.
Design the architecture and API for the requirements below.

Input:
{{input}}

Respond with JSON only:
{"summary": "...", "databaseSchema": "...", "apiEndpoints": [{"method": "GET", "path": "/api/...", "description": "..."}], "componentDesign": "..."}
"#;

const PG_TEMPLATE: &str = r#"You are a Programmer.
Implement the design below.

Input:
{{input}}

Respond with JSON only, escaping quotes inside file contents:
{"summary": "...", "files": [{"path": "...", "content": "..."}]}
"#;

const QA_TEMPLATE: &str = r#"You are a QA Engineer.
Review the code below and write a test plan.

Input:
{{input}}

Respond with JSON only:
{"summary": "...", "testCases": [{"id": "TC-001", "description": "...", "expectedResult": "..."}], "codeReview": [{"file": "...", "issues": ["..."]}]}
"#;

/// Static prompt template for a built-in role. Custom roles have none.
pub fn prompt_template(role: &AgentRole) -> Option<&'static str> {
    match role {
        AgentRole::Pm => Some(PM_TEMPLATE),
        AgentRole::Sa => Some(SA_TEMPLATE),
        AgentRole::Pg => Some(PG_TEMPLATE),
        AgentRole::Qa => Some(QA_TEMPLATE),
        AgentRole::Custom(_) => None,
    }
}

/// Fill a template's `{{input}}` slot with the context as pretty JSON.
pub fn render_prompt(template: &str, input: &ContextMap) -> Result<String> {
    let input_json =
        serde_json::to_string_pretty(input).context("Failed to serialize prompt input")?;
    Ok(template.replace("{{input}}", &input_json))
}

/// Parse a model reply into a JSON object.
///
/// Tolerates markdown fences and prose around the object by taking the span
/// from the first `{` to the last `}`.
pub fn parse_json_object(reply: &str) -> Result<ContextMap> {
    let cleaned = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => reply.trim(),
    };
    serde_json::from_str(cleaned).context("Failed to parse LLM response as a JSON object")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_object() {
        let map = parse_json_object(r#"{"summary": "ok", "n": 3}"#).unwrap();
        assert_eq!(map["summary"], json!("ok"));
        assert_eq!(map["n"], json!(3));
    }

    #[test]
    fn test_parse_with_markdown_wrapping() {
        let wrapped = r#"Here you go:
```json
{
    "summary": "Architecture ready",
    "apiEndpoints": []
}
```
Anything else?"#;
        let map = parse_json_object(wrapped).unwrap();
        assert_eq!(map["summary"], json!("Architecture ready"));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(parse_json_object("not json at all").is_err());
        assert!(parse_json_object("[1, 2, 3]").is_err());
        assert!(parse_json_object("} backwards {").is_err());
    }

    #[test]
    fn test_templates_exist_for_builtin_roles_only() {
        for role in AgentRole::required() {
            let template = prompt_template(&role).unwrap();
            assert!(template.contains("{{input}}"));
        }
        assert!(prompt_template(&AgentRole::Custom("X".into())).is_none());
    }

    #[test]
    fn test_render_prompt_embeds_context() {
        let mut input = ContextMap::new();
        input.insert("description".into(), json!("A todo app"));
        let prompt = render_prompt(prompt_template(&AgentRole::Pm).unwrap(), &input).unwrap();
        assert!(prompt.contains("\"description\": \"A todo app\""));
        assert!(!prompt.contains("{{input}}"));
    }

    #[tokio::test]
    async fn test_command_client_returns_stdout() {
        let client = CommandLlmClient::new(
            "sh",
            &["-c".to_string(), "printf '{\"summary\":\"hi\"}'".to_string()],
        );
        let reply = client.generate("ignored prompt").await.unwrap();
        assert_eq!(parse_json_object(&reply).unwrap()["summary"], json!("hi"));
    }

    #[tokio::test]
    async fn test_command_client_reports_failure() {
        let client = CommandLlmClient::new(
            "sh",
            &["-c".to_string(), "echo quota exceeded >&2; exit 3".to_string()],
        );
        let err = client.generate("prompt").await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_command_client_missing_binary() {
        let client = CommandLlmClient::new("definitely-not-a-real-llm-binary", &[]);
        let err = client.generate("prompt").await.unwrap_err();
        assert!(err.to_string().contains("Failed to run LLM command"));
    }

    #[tokio::test]
    async fn test_command_client_is_killed_when_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let client = CommandLlmClient::new(
            "sh",
            &["-c".to_string(), format!("sleep 1; touch '{}'", marker.display())],
        );

        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(100), client.generate("prompt")).await;
        assert!(outcome.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "LLM command kept running after its caller gave up");
    }
}
