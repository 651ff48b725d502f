//! Type definitions for the agent module

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::tools::ToolCapability;

/// Role of a message in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing context and instructions
    System,
    /// User message
    User,
    /// Assistant (AI) response
    Assistant,
    /// Tool/function result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender
    pub role: Role,
    /// Content of the message
    pub content: String,
    /// Optional name (for tool messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional tool call ID (for tool messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Optional tool calls made by assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<AssistantToolCall>>,
}

impl Message {
    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Create an assistant message that requests tool calls
    pub fn assistant_with_tools(
        content: impl Into<String>,
        tool_calls: Vec<AssistantToolCall>,
    ) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Some(tool_calls),
        }
    }

    /// Create a new tool result message
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }
}

/// Tool call made by the assistant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantToolCall {
    /// Unique ID for this tool call
    pub id: String,
    /// Type of tool call (usually "function")
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function details
    pub function: FunctionCall,
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to call
    pub name: String,
    /// Arguments as JSON string
    pub arguments: String,
}

/// Request to the OpenRouter API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    /// Model to use
    pub model: String,
    /// Messages in the conversation
    pub messages: Vec<Message>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Top-p sampling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Available tools/functions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool choice strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// Tool definition for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Type of tool (usually "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function definition
    pub function: FunctionDefinition,
}

/// Function definition for tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Name of the function
    pub name: String,
    /// Description of what the function does
    pub description: String,
    /// JSON Schema for function parameters
    pub parameters: serde_json::Value,
}

/// Tool choice strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// Let the model decide
    Auto,
}

/// Response from the OpenRouter API
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    /// Unique ID for this completion
    pub id: String,
    /// Model used
    pub model: String,
    /// Completion choices
    pub choices: Vec<Choice>,
    /// Usage statistics
    pub usage: Option<Usage>,
}

/// A completion choice
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// Index of this choice
    pub index: u32,
    /// The generated message
    pub message: Message,
    /// Reason for stopping
    pub finish_reason: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Tokens in the completion
    #[serde(default)]
    pub completion_tokens: u64,
    /// Total tokens used
    #[serde(default)]
    pub total_tokens: u64,
    /// Prompt breakdown, when the provider reports one
    #[serde(default)]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

impl Usage {
    /// Prompt tokens served from the provider's cache
    pub fn cached_tokens(&self) -> u64 {
        self.prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0)
    }
}

/// Prompt token breakdown
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

/// Generation options for chat completions
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Top-p sampling (0.0 - 1.0)
    pub top_p: Option<f32>,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
}

/// Gate controlling which tools a task may see and call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Read-only tools only
    #[default]
    Restricted,
    /// The complete catalog
    Full,
}

impl PermissionMode {
    pub fn allows(&self, capability: ToolCapability) -> bool {
        match self {
            PermissionMode::Full => true,
            PermissionMode::Restricted => capability == ToolCapability::ReadOnly,
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionMode::Restricted => write!(f, "restricted"),
            PermissionMode::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "restricted" => Ok(PermissionMode::Restricted),
            "full" => Ok(PermissionMode::Full),
            other => Err(crate::Error::Config(format!(
                "unknown permission mode '{}' (expected 'restricted' or 'full')",
                other
            ))),
        }
    }
}

/// Per-million-token pricing for one model family
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Fraction of the input rate charged for cache-served prompt tokens
const CACHE_READ_DISCOUNT: f64 = 0.1;

impl ModelPricing {
    /// Rates by model name substring, with a conservative default
    pub fn for_model(model: &str) -> Self {
        let model = model.to_lowercase();
        if model.contains("haiku") {
            ModelPricing {
                input_per_mtok: 0.8,
                output_per_mtok: 4.0,
            }
        } else if model.contains("gpt") {
            ModelPricing {
                input_per_mtok: 1.0,
                output_per_mtok: 3.0,
            }
        } else {
            ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            }
        }
    }
}

/// Accumulated token and dollar cost of a task
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostLedger {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub model_calls: u32,
    /// Wall-clock time spent inside model calls
    pub elapsed_ms: u64,
    pub cost_usd: f64,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one model call's usage into the ledger
    pub fn record(&mut self, model: &str, usage: &Usage, elapsed_ms: u64) {
        let cached = usage.cached_tokens();
        let fresh = usage.prompt_tokens.saturating_sub(cached);
        let pricing = ModelPricing::for_model(model);

        self.input_tokens += usage.prompt_tokens;
        self.output_tokens += usage.completion_tokens;
        self.cached_tokens += cached;
        self.model_calls += 1;
        self.elapsed_ms += elapsed_ms;
        self.cost_usd += (fresh as f64) * pricing.input_per_mtok / 1_000_000.0
            + (cached as f64) * pricing.input_per_mtok * CACHE_READ_DISCOUNT / 1_000_000.0
            + (usage.completion_tokens as f64) * pricing.output_per_mtok / 1_000_000.0;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One task for the execution loop
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// What the agent is asked to do
    pub prompt: String,
    /// Optional system prompt prepended to the transcript
    pub system_prompt: Option<String>,
    /// Which tools the task may use
    pub permission_mode: PermissionMode,
    /// Upper bound on model-call turns
    pub max_turns: u32,
    /// Wall-clock budget for the whole task
    pub max_duration: Duration,
    /// Per-tool-call budget
    pub dispatch_timeout: Duration,
    /// Concurrent tool dispatches per turn
    pub max_inflight: usize,
    /// Sampling options forwarded to the model
    pub options: GenerationOptions,
}

impl TaskRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        TaskRequest {
            prompt: prompt.into(),
            system_prompt: None,
            permission_mode: PermissionMode::default(),
            max_turns: 20,
            max_duration: Duration::from_secs(600),
            dispatch_timeout: Duration::from_secs(60),
            max_inflight: 4,
            options: GenerationOptions::default(),
        }
    }
}

/// Why a task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced a turn with no tool calls
    Completed,
    /// Turn budget ran out
    MaxTurnsExceeded,
    /// Wall-clock budget ran out
    DeadlineExceeded,
    /// Cancelled from outside
    Cancelled,
    /// The model call failed beyond retry
    ModelFailure,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::MaxTurnsExceeded => write!(f, "max turns exceeded"),
            StopReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::ModelFailure => write!(f, "model failure"),
        }
    }
}

/// Final product of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// The model's final answer, or the last content seen before stopping
    pub response: String,
    pub stop_reason: StopReason,
    /// Turns actually executed
    pub turns: u32,
    pub ledger: CostLedger,
    /// Full transcript, useful when the task was interrupted
    pub transcript: Vec<Message>,
}

/// Progress notifications emitted while a task runs
#[derive(Debug, Clone)]
pub enum TaskEvent {
    TurnStarted {
        turn: u32,
    },
    ModelResponded {
        content: String,
        tool_calls: usize,
    },
    ToolStarted {
        id: String,
        name: String,
    },
    ToolFinished {
        id: String,
        name: String,
        success: bool,
        elapsed_ms: u64,
    },
    TaskFinished {
        stop_reason: StopReason,
    },
}
