//! Tool registry - one catalog over native and server-provided tools
//!
//! Native tools are registered at startup; server tools arrive through
//! discovery and are replaced wholesale per server on re-discovery. On a
//! name collision the native tool wins, and between servers the earlier
//! discovery wins; losers are recorded so a status command can show them.
//! Dispatch validates arguments against the declared schema before any
//! execution, so a malformed call never reaches a server.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, warn};

use crate::agent::{PermissionMode, ToolDefinition};
use crate::error::{Error, Result};
use crate::mcp::{McpTool, McpToolResult, ServerRegistry};

use super::schema;
use super::traits::{Tool, ToolCapability, ToolInvocation, ToolResult};

/// A server tool that lost a name collision
#[derive(Debug, Clone, Serialize)]
pub struct ShadowedTool {
    pub name: String,
    /// Server that offered the losing tool
    pub server: String,
    /// `"native"` or the server that won
    pub shadowed_by: String,
}

/// One catalog row, for listings
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    /// `"native"` or the owning server
    pub source: String,
    pub capability: ToolCapability,
    pub description: String,
}

struct RemoteEntry {
    server: String,
    tool: McpTool,
}

enum Target {
    Native(Arc<dyn Tool>),
    Remote { server: String },
}

/// Registry of available tools
pub struct ToolRegistry {
    native: HashMap<String, Arc<dyn Tool>>,
    remote: RwLock<HashMap<String, RemoteEntry>>,
    shadowed: RwLock<Vec<ShadowedTool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        ToolRegistry {
            native: HashMap::new(),
            remote: RwLock::new(HashMap::new()),
            shadowed: RwLock::new(Vec::new()),
        }
    }

    /// Register a native tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already-shared native tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.native.insert(tool.name().to_string(), tool);
    }

    /// Replace one server's tools with a fresh discovery snapshot.
    ///
    /// The server's previous entries are dropped first, so a tool the
    /// server no longer offers disappears from the catalog.
    pub fn set_remote_tools(&self, server: &str, tools: Vec<McpTool>) {
        let mut remote = self.remote.write().unwrap_or_else(|e| e.into_inner());
        let mut shadowed = self.shadowed.write().unwrap_or_else(|e| e.into_inner());

        remote.retain(|_, entry| entry.server != server);
        shadowed.retain(|s| s.server != server);

        let mut kept = 0usize;
        for tool in tools {
            if self.native.contains_key(&tool.name) {
                warn!(
                    "Tool '{}' from server '{}' is shadowed by a native tool",
                    tool.name, server
                );
                shadowed.push(ShadowedTool {
                    name: tool.name,
                    server: server.to_string(),
                    shadowed_by: "native".to_string(),
                });
                continue;
            }
            if let Some(existing) = remote.get(&tool.name) {
                warn!(
                    "Tool '{}' from server '{}' is shadowed by server '{}'",
                    tool.name, server, existing.server
                );
                shadowed.push(ShadowedTool {
                    name: tool.name,
                    server: server.to_string(),
                    shadowed_by: existing.server.clone(),
                });
                continue;
            }
            kept += 1;
            remote.insert(
                tool.name.clone(),
                RemoteEntry {
                    server: server.to_string(),
                    tool,
                },
            );
        }
        debug!("Server '{}' contributes {} tools to the catalog", server, kept);
    }

    /// Tools that lost a name collision
    pub fn shadowed(&self) -> Vec<ShadowedTool> {
        self.shadowed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Definitions of every tool visible under `mode`, sorted by name
    pub fn definitions(&self, mode: PermissionMode) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .native
            .values()
            .filter(|tool| mode.allows(tool.capability()))
            .map(|tool| tool.to_definition())
            .collect();

        let remote = self.remote.read().unwrap_or_else(|e| e.into_inner());
        for entry in remote.values() {
            if !mode.allows(remote_capability(&entry.tool)) {
                continue;
            }
            defs.push(ToolDefinition {
                tool_type: "function".to_string(),
                function: crate::agent::FunctionDefinition {
                    name: entry.tool.name.clone(),
                    description: entry.tool.description.clone(),
                    parameters: entry.tool.input_schema.to_schema_value(),
                },
            });
        }

        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Full catalog with sources and capabilities, sorted by name
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .native
            .values()
            .map(|tool| CatalogEntry {
                name: tool.name().to_string(),
                source: "native".to_string(),
                capability: tool.capability(),
                description: tool.description().to_string(),
            })
            .collect();

        let remote = self.remote.read().unwrap_or_else(|e| e.into_inner());
        for entry in remote.values() {
            entries.push(CatalogEntry {
                name: entry.tool.name.clone(),
                source: entry.server.clone(),
                capability: remote_capability(&entry.tool),
                description: entry.tool.description.clone(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Get tool count
    pub fn count(&self) -> usize {
        self.native.len() + self.remote.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// List visible tool names under `mode`, sorted
    pub fn names(&self, mode: PermissionMode) -> Vec<String> {
        self.definitions(mode)
            .into_iter()
            .map(|d| d.function.name)
            .collect()
    }

    /// Declared input schema of a tool, native or discovered
    pub fn schema_for(&self, name: &str) -> Result<Value> {
        if let Some(tool) = self.native.get(name) {
            return Ok(tool.parameters_schema());
        }
        let remote = self.remote.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = remote.get(name) {
            return Ok(entry.tool.input_schema.to_schema_value());
        }
        Err(Error::UnknownTool(format!("'{}'", name)))
    }

    /// Validate and run one tool call.
    ///
    /// Resolution and schema validation happen before any execution, so an
    /// unknown name or malformed arguments never touch a server. Native
    /// tools run under the invocation's deadline and cancel token; server
    /// tools inherit the same bounds inside the protocol client. Returned
    /// results carry the wall-clock time the dispatch took.
    pub async fn dispatch(
        &self,
        invocation: ToolInvocation,
        mode: PermissionMode,
        servers: &ServerRegistry,
    ) -> Result<ToolResult> {
        let started = Instant::now();
        let (target, schema) = self.resolve(&invocation.name, mode)?;
        schema::validate_arguments(&invocation.name, &schema, &invocation.arguments)?;

        let executed = match target {
            Target::Native(tool) => {
                debug!("Dispatching '{}' natively", invocation.name);
                let execution = tool.execute(invocation.arguments.clone());
                tokio::select! {
                    biased;
                    _ = invocation.cancel.cancelled() => Err(Error::Cancelled(format!(
                        "tool '{}' cancelled",
                        invocation.name
                    ))),
                    outcome = tokio::time::timeout(invocation.deadline, execution) => match outcome {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "tool '{}' exceeded {:?}",
                            invocation.name, invocation.deadline
                        ))),
                    },
                }
            }
            Target::Remote { server } => {
                debug!("Dispatching '{}' to server '{}'", invocation.name, server);
                servers
                    .invoke(
                        &server,
                        &invocation.name,
                        invocation.arguments.clone(),
                        invocation.deadline,
                        &invocation.cancel,
                    )
                    .await
                    .map(from_mcp_result)
            }
        };

        let mut result = executed?;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    fn resolve(&self, name: &str, mode: PermissionMode) -> Result<(Target, Value)> {
        if let Some(tool) = self.native.get(name) {
            if !mode.allows(tool.capability()) {
                return Err(Error::UnknownTool(format!(
                    "tool '{}' is not available in {} mode",
                    name, mode
                )));
            }
            return Ok((Target::Native(tool.clone()), tool.parameters_schema()));
        }

        let remote = self.remote.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = remote.get(name) {
            if !mode.allows(remote_capability(&entry.tool)) {
                return Err(Error::UnknownTool(format!(
                    "tool '{}' is not available in {} mode",
                    name, mode
                )));
            }
            return Ok((
                Target::Remote {
                    server: entry.server.clone(),
                },
                entry.tool.input_schema.to_schema_value(),
            ));
        }

        Err(Error::UnknownTool(format!("'{}'", name)))
    }
}

fn remote_capability(tool: &McpTool) -> ToolCapability {
    if tool.is_read_only() {
        ToolCapability::ReadOnly
    } else {
        ToolCapability::SideEffecting
    }
}

fn from_mcp_result(result: McpToolResult) -> ToolResult {
    let text = result.text();
    if result.is_error {
        if text.is_empty() {
            ToolResult::failure("tool reported an error")
        } else {
            ToolResult::failure(text)
        }
    } else {
        ToolResult::success(text)
    }
}
