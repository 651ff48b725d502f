//! Tools module - the merged catalog of native and server-provided tools
//!
//! Each native tool is a self-contained module implementing the `Tool` trait.
//! Tools are registered into a `ToolRegistry`, which also carries every tool
//! discovered from connected MCP servers and presents one merged catalog to
//! the model. Dispatch resolves a name to its owner, validates arguments
//! against the declared schema, and only then runs the tool.
//!
//! ## Built-in Tools
//!
//! - **read_file**: Read files from the workspace
//! - **write_file**: Write/create files in the workspace
//! - **task**: Delegate a bounded job to a read-only sub-agent
//!
//! ## Adding a New Tool
//!
//! 1. Create a new file in `src/tools/` (e.g., `my_tool.rs`)
//! 2. Implement the `Tool` trait, including its capability tag
//! 3. Add `mod my_tool;` and `pub use` in this file
//! 4. Register it where the catalog is assembled (src/bin/cli.rs)

mod traits;
mod schema;
mod registry;
mod read_file;
mod write_file;
mod task;

// Core trait and types
pub use traits::{Tool, ToolCapability, ToolResult, ToolCall, ToolInvocation};

// Registry
pub use registry::{ToolRegistry, CatalogEntry, ShadowedTool};

// Built-in tools
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;
pub use task::TaskTool;
