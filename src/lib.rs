//! # Agentry
//!
//! An agent runtime that drives large-language-model tasks over a fleet of
//! heterogeneous MCP tool servers.
//!
//! ## Features
//!
//! - **One Catalog, Many Servers:** Native tools and tools discovered from
//!   stdio or SSE MCP servers, merged behind a single registry
//! - **Multiplexed Protocol Client:** Concurrent requests over one
//!   connection per server, with cancellation and per-call deadlines
//! - **Bounded Execution Loop:** Turn, wall-clock, and concurrency budgets
//!   with distinguishable stop reasons
//! - **OpenRouter Integration:** Unified access to any LLM via a single API
//!   key, with retry and USD cost accounting
//! - **Permission Gating:** Restricted mode hides every side-effecting tool

pub mod agent;
pub mod config;
pub mod error;
pub mod mcp;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
