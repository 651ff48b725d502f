//! Agent module - model access and the task execution loop
//!
//! This module owns everything between a prompt and its outcome:
//! - OpenRouter API client for multi-model LLM access, with retry and
//!   cost accounting
//! - The `ModelClient` trait, so the executor never depends on one provider
//! - The task executor: turn loop, concurrent tool dispatch, budgets,
//!   cancellation, and stop reporting
//! - Message, permission, and pricing types shared across the crate

mod client;
mod executor;
mod types;

pub use client::{ModelClient, ModelTurn, OpenRouterClient};
pub use executor::TaskExecutor;
pub use types::*;
