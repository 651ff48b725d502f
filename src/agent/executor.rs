//! Task executor: the model-call / tool-dispatch loop.
//!
//! Drives one task through repeated turns: call the model with the visible
//! tool catalog, dispatch whatever tool calls come back (concurrently, up to
//! a configured in-flight bound), append the results in request order, and
//! go again. Stops on completion, turn or wall-clock exhaustion, outside
//! cancellation, or a model failure that survives retry; the outcome labels
//! which one happened.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::client::ModelClient;
use crate::agent::types::{
    CostLedger, Message, StopReason, TaskEvent, TaskOutcome, TaskRequest,
};
use crate::mcp::ServerRegistry;
use crate::tools::{ToolCall, ToolInvocation, ToolRegistry, ToolResult};

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs tasks against one model, one tool catalog, and one set of servers
pub struct TaskExecutor {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    servers: Arc<ServerRegistry>,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl TaskExecutor {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        servers: Arc<ServerRegistry>,
    ) -> Self {
        TaskExecutor {
            model,
            tools,
            servers,
            events: None,
        }
    }

    /// Emit progress events to the given channel while tasks run
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drive one task to its end.
    ///
    /// Every way out is reported through the outcome's stop reason; the
    /// transcript is returned as it stood when the task stopped.
    pub async fn run(&self, request: TaskRequest, cancel: CancellationToken) -> TaskOutcome {
        let started = Instant::now();

        let mut transcript: Vec<Message> = Vec::new();
        if let Some(ref system) = request.system_prompt {
            transcript.push(Message::system(system));
        }
        transcript.push(Message::user(&request.prompt));

        let tool_definitions = self.tools.definitions(request.permission_mode);
        info!(
            "Task started: mode={}, {} tools visible, max {} turns",
            request.permission_mode,
            tool_definitions.len(),
            request.max_turns
        );

        let mut ledger = CostLedger::new();
        let mut turns: u32 = 0;
        let mut final_response = String::new();

        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if turns >= request.max_turns {
                warn!("Task hit its turn limit ({})", request.max_turns);
                break StopReason::MaxTurnsExceeded;
            }
            let remaining = match request.max_duration.checked_sub(started.elapsed()) {
                Some(rem) if !rem.is_zero() => rem,
                _ => {
                    warn!("Task hit its wall-clock limit ({:?})", request.max_duration);
                    break StopReason::DeadlineExceeded;
                }
            };

            turns += 1;
            self.emit(TaskEvent::TurnStarted { turn: turns });
            info!("Task turn {}/{}", turns, request.max_turns);

            // Model call, bounded by the remaining budget and the cancel token
            let model_call = self
                .model
                .complete(&transcript, &tool_definitions, &request.options);
            let turn = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                outcome = tokio::time::timeout(remaining, model_call) => match outcome {
                    Ok(Ok(turn)) => turn,
                    Ok(Err(e)) => {
                        warn!("Model call failed beyond retry: {}", e);
                        if final_response.is_empty() {
                            final_response = format!("Model call failed: {}", e);
                        }
                        break StopReason::ModelFailure;
                    }
                    Err(_) => {
                        warn!("Model call outlived the task deadline");
                        break StopReason::DeadlineExceeded;
                    }
                },
            };

            ledger.record(self.model.model(), &turn.usage, turn.elapsed_ms);

            let tool_calls = parse_tool_calls(&turn.message);
            self.emit(TaskEvent::ModelResponded {
                content: turn.message.content.clone(),
                tool_calls: tool_calls.len(),
            });

            // Zero tool calls means the task is done
            if tool_calls.is_empty() {
                final_response = turn.message.content.clone();
                if !final_response.is_empty() {
                    debug!("Final answer: {}", truncate_log(&final_response, 500));
                } else {
                    warn!("Model finished with an empty response");
                }
                transcript.push(turn.message);
                break StopReason::Completed;
            }

            info!("Model requested {} tool calls", tool_calls.len());
            if !turn.message.content.is_empty() {
                final_response = turn.message.content.clone();
            }
            transcript.push(turn.message);

            let budget = match request.max_duration.checked_sub(started.elapsed()) {
                Some(rem) if !rem.is_zero() => rem,
                _ => break StopReason::DeadlineExceeded,
            };
            let results = self
                .dispatch_turn(&tool_calls, &request, budget, &cancel)
                .await;
            transcript.extend(results);
        };

        self.emit(TaskEvent::TaskFinished { stop_reason });
        info!(
            "Task finished: reason={}, turns={}, tokens={}, cost=${:.4}",
            stop_reason,
            turns,
            ledger.total_tokens(),
            ledger.cost_usd
        );

        TaskOutcome {
            response: final_response,
            stop_reason,
            turns,
            ledger,
            transcript,
        }
    }

    // -----------------------------------------------------------------------
    // Tool dispatch
    // -----------------------------------------------------------------------

    /// Dispatch one turn's tool calls, bounded by `max_inflight`.
    ///
    /// Completions may land in any order; results are reassembled into the
    /// order the model requested them before they join the transcript. Every
    /// call produces a tool message, failure included, so the model always
    /// sees one result per request.
    async fn dispatch_turn(
        &self,
        calls: &[ToolCall],
        request: &TaskRequest,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Vec<Message> {
        let per_call = request.dispatch_timeout.min(budget);
        let mode = request.permission_mode;

        let mut results: Vec<(usize, Message)> = stream::iter(
            calls.to_vec().into_iter().enumerate(),
        )
        .map(|(index, call)| {
            let invocation = ToolInvocation::from_call(&call, per_call, cancel.clone());
            async move {
                self.emit(TaskEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                let dispatch_start = Instant::now();
                let result = match self.tools.dispatch(invocation, mode, &self.servers).await {
                    Ok(result) => {
                        debug!(
                            "Tool {} finished in {}ms: {}",
                            call.name,
                            result.elapsed_ms,
                            truncate_log(&result.to_string(), 200)
                        );
                        result
                    }
                    Err(e) => {
                        warn!("Tool {} failed: {}", call.name, e);
                        let mut failure = ToolResult::from_error(&e);
                        failure.elapsed_ms = dispatch_start.elapsed().as_millis() as u64;
                        failure
                    }
                };
                self.emit(TaskEvent::ToolFinished {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    success: result.success,
                    elapsed_ms: result.elapsed_ms,
                });
                (index, Message::tool(&call.id, &result.to_string()))
            }
        })
        .buffer_unordered(request.max_inflight.max(1))
        .collect()
        .await;

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, message)| message).collect()
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pull the tool calls out of an assistant message
fn parse_tool_calls(message: &Message) -> Vec<ToolCall> {
    let calls = match &message.tool_calls {
        Some(calls) => calls,
        None => return Vec::new(),
    };
    calls
        .iter()
        .map(|tc| {
            let arguments = match serde_json::from_str(&tc.function.arguments) {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "Failed to parse arguments for tool {}: {}",
                        tc.function.name, e
                    );
                    serde_json::json!({})
                }
            };
            ToolCall {
                id: tc.id.clone(),
                name: tc.function.name.clone(),
                arguments,
            }
        })
        .collect()
}

fn truncate_log(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
