//! Sub-agent tool: lets the model delegate a self-contained job.
//!
//! The `task` tool runs a nested executor over the same catalog and servers,
//! but in restricted mode and under tighter turn and wall-clock budgets. The
//! sub-agent never sees the `task` tool itself, so delegation cannot recurse.
//! Its cost is reported back in the result so the caller's ledger stays
//! honest about what the detour spent.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{ModelClient, PermissionMode, StopReason, TaskExecutor, TaskRequest};
use crate::error::{Error, Result};
use crate::mcp::ServerRegistry;
use crate::tools::registry::ToolRegistry;
use crate::tools::traits::{Tool, ToolCapability, ToolResult};

/// Turn budget for a delegated job
const SUB_AGENT_MAX_TURNS: u32 = 10;
/// Wall-clock budget for a delegated job
const SUB_AGENT_MAX_DURATION: Duration = Duration::from_secs(120);

/// Tool that runs a bounded sub-agent over the shared catalog
pub struct TaskTool {
    model: Arc<dyn ModelClient>,
    servers: Arc<ServerRegistry>,
    // Set after the owning registry is built; the registry holds this tool,
    // so the handle cannot exist at construction time.
    tools: OnceLock<Arc<ToolRegistry>>,
}

impl TaskTool {
    pub fn new(model: Arc<dyn ModelClient>, servers: Arc<ServerRegistry>) -> Self {
        TaskTool {
            model,
            servers,
            tools: OnceLock::new(),
        }
    }

    /// Point the tool at the registry it was registered into.
    ///
    /// Later calls are ignored; the first binding wins.
    pub fn bind(&self, tools: Arc<ToolRegistry>) {
        let _ = self.tools.set(tools);
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained job to a sub-agent that works through it with read-only tools and reports back. Use this for research or multi-step lookups that would clutter the main conversation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "Short (3-5 word) label for the job"
                },
                "prompt": {
                    "type": "string",
                    "description": "Full instructions for the sub-agent. It sees nothing but this text, so include everything it needs."
                }
            },
            "required": ["description", "prompt"]
        })
    }

    fn capability(&self) -> ToolCapability {
        ToolCapability::SideEffecting
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let description = args
            .get("description")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::SchemaValidation("Missing 'description' parameter".into()))?;
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::SchemaValidation("Missing 'prompt' parameter".into()))?;

        let tools = match self.tools.get() {
            Some(tools) => tools.clone(),
            None => {
                return Ok(ToolResult::failure(
                    "The task tool is not wired to a tool catalog yet",
                ))
            }
        };

        info!("Sub-agent started: {}", description);

        let mut request = TaskRequest::new(prompt);
        request.permission_mode = PermissionMode::Restricted;
        request.max_turns = SUB_AGENT_MAX_TURNS;
        request.max_duration = SUB_AGENT_MAX_DURATION;

        let executor = TaskExecutor::new(self.model.clone(), tools, self.servers.clone());
        let outcome = executor.run(request, CancellationToken::new()).await;

        info!(
            "Sub-agent finished: {} ({}, {} turns, ${:.4})",
            description, outcome.stop_reason, outcome.turns, outcome.ledger.cost_usd
        );

        let metadata = json!({
            "stop_reason": outcome.stop_reason,
            "turns": outcome.turns,
            "tokens": outcome.ledger.total_tokens(),
            "cost_usd": outcome.ledger.cost_usd,
        });

        if outcome.stop_reason == StopReason::Completed {
            let mut content = outcome.response;
            content.push_str(&format!(
                "\n\n[sub-agent: {} turns, {} tokens, ${:.4}]",
                outcome.turns,
                outcome.ledger.total_tokens(),
                outcome.ledger.cost_usd
            ));
            Ok(ToolResult::success_with_metadata(content, metadata))
        } else {
            Ok(ToolResult::failure(format!(
                "Sub-agent stopped early ({}). Last response: {}",
                outcome.stop_reason,
                if outcome.response.is_empty() {
                    "<none>"
                } else {
                    &outcome.response
                }
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{GenerationOptions, Message, ModelTurn, ToolDefinition, Usage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        script: Mutex<VecDeque<Message>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Message>) -> Arc<Self> {
            Arc::new(ScriptedModel {
                script: Mutex::new(turns.into()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn model(&self) -> &str {
            "test/scripted"
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _options: &GenerationOptions,
        ) -> crate::error::Result<ModelTurn> {
            let message = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::ModelCall("script exhausted".to_string()))?;
            Ok(ModelTurn {
                message,
                usage: Usage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                    total_tokens: 150,
                    prompt_tokens_details: None,
                },
                elapsed_ms: 2,
            })
        }
    }

    fn empty_servers() -> Arc<ServerRegistry> {
        Arc::new(ServerRegistry::new(Vec::new()).unwrap())
    }

    fn wired_tool(model: Arc<dyn ModelClient>) -> (Arc<TaskTool>, Arc<ToolRegistry>) {
        let tool = Arc::new(TaskTool::new(model, empty_servers()));
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let registry = Arc::new(registry);
        tool.bind(registry.clone());
        (tool, registry)
    }

    #[tokio::test]
    async fn test_runs_a_nested_task_and_reports_cost() {
        let model = ScriptedModel::new(vec![Message::assistant("the capital is Paris")]);
        let (tool, _registry) = wired_tool(model);

        let result = tool
            .execute(json!({ "description": "capital lookup", "prompt": "capital of France?" }))
            .await
            .unwrap();

        assert!(result.success);
        let content = result.content.unwrap();
        assert!(content.contains("the capital is Paris"));
        assert!(content.contains("1 turns"));
        assert!(content.contains("150 tokens"));
        let metadata = result.metadata.unwrap();
        assert_eq!(metadata["stop_reason"], "completed");
        assert_eq!(metadata["turns"], 1);
    }

    #[tokio::test]
    async fn test_early_stop_is_a_tool_failure() {
        // Script runs dry, so the nested model call fails
        let model = ScriptedModel::new(vec![]);
        let (tool, _registry) = wired_tool(model);

        let result = tool
            .execute(json!({ "description": "doomed", "prompt": "anything" }))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.to_string().contains("model failure"));
    }

    #[tokio::test]
    async fn test_missing_prompt_is_rejected() {
        let model = ScriptedModel::new(vec![]);
        let (tool, _registry) = wired_tool(model);

        let err = tool
            .execute(json!({ "description": "no prompt" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaValidation(_)));
    }

    #[tokio::test]
    async fn test_unbound_tool_fails_cleanly() {
        let model = ScriptedModel::new(vec![Message::assistant("unused")]);
        let tool = TaskTool::new(model, empty_servers());

        let result = tool
            .execute(json!({ "description": "x", "prompt": "y" }))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.to_string().contains("not wired"));
    }

    #[test]
    fn test_sub_agents_cannot_see_the_task_tool() {
        let model = ScriptedModel::new(vec![]);
        let (_tool, registry) = wired_tool(model);

        // Restricted mode is what sub-agents run under
        let nested: Vec<String> = registry
            .definitions(PermissionMode::Restricted)
            .iter()
            .map(|d| d.function.name.clone())
            .collect();
        assert!(!nested.contains(&"task".to_string()));

        // The tool is still there for full-mode callers
        let full: Vec<String> = registry
            .definitions(PermissionMode::Full)
            .iter()
            .map(|d| d.function.name.clone())
            .collect();
        assert!(full.contains(&"task".to_string()));
    }
}
