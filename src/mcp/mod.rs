//! MCP (Model Context Protocol) module
//!
//! Connects the agent to external tool servers that implement the Model
//! Context Protocol, over a local subprocess or a remote SSE endpoint.
//!
//! ## Architecture
//!
//! - **protocol**: Wire protocol types (JSON-RPC based)
//! - **transport**: Frame channels (stdio subprocess, SSE)
//! - **client**: Handshake, request correlation, and invocation on one connection
//! - **registry**: Lifecycle and status across all configured servers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use agentry::config::ServerConfig;
//! use agentry::mcp::ServerRegistry;
//!
//! # async fn example() -> agentry::Result<()> {
//! let registry = ServerRegistry::new(vec![
//!     ServerConfig::stdio("files", "mcp-server-files", vec![]),
//! ])?;
//!
//! // First use starts the subprocess and runs the handshake
//! let tools = registry.discover("files").await?;
//! println!("{} tools available", tools.len());
//! # Ok(())
//! # }
//! ```

mod client;
mod protocol;
mod registry;
mod transport;

pub use client::{ConnectionState, McpClient};
pub use protocol::{
    InitializeResult, McpContent, McpRequest, McpResponse, McpTool, McpToolInput, McpToolResult,
    ToolAnnotations, PROTOCOL_VERSION,
};
pub use registry::{ServerRegistry, ServerStatus};
pub use transport::{Transport, TransportEvent};
