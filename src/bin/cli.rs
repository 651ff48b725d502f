//! Agentry CLI
//!
//! Command-line interface for inspecting tool servers and running tasks.

use agentry::agent::{
    ModelClient, OpenRouterClient, PermissionMode, StopReason, TaskEvent, TaskExecutor,
    TaskRequest,
};
use agentry::config::{Config, LogConfig};
use agentry::mcp::{ConnectionState, ServerRegistry};
use agentry::tools::{ReadFileTool, TaskTool, ToolRegistry, WriteFileTool};
use agentry::{Result, VERSION};
use clap::{Parser, Subcommand};
use console::style;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "agentry",
    author = "Agentry Contributors",
    version = VERSION,
    about = "Agentry - agent runtime over MCP tool servers",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured server and report its state
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the merged tool catalog
    Tools {
        /// Permission mode to filter by (restricted or full)
        #[arg(short, long, default_value = "full")]
        mode: PermissionMode,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run one task to completion
    Run {
        /// The task prompt
        prompt: String,
        /// Model to use instead of the configured default
        #[arg(short = 'M', long)]
        model: Option<String>,
        /// Permission mode (restricted or full)
        #[arg(short, long, default_value = "restricted")]
        mode: PermissionMode,
        /// System prompt prepended to the transcript
        #[arg(long)]
        system: Option<String>,
        /// Turn budget override
        #[arg(long)]
        max_turns: Option<u32>,
        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
        /// Emit the full outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    init_logging(&config.log);

    match cli.command {
        Commands::Status { json } => check_status(config, json).await,
        Commands::Tools { mode, json } => list_tools(config, mode, json).await,
        Commands::Run {
            prompt,
            model,
            mode,
            system,
            max_turns,
            quiet,
            json,
        } => run_task(config, prompt, model, mode, system, max_turns, quiet, json).await,
    }
}

fn init_logging(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&log.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ============================================================================
// Shared Assembly
// ============================================================================

/// Build the model client, the merged tool catalog, and the server registry
async fn build_runtime(
    config: &Config,
    model_override: Option<String>,
) -> Result<(Arc<dyn ModelClient>, Arc<ToolRegistry>, Arc<ServerRegistry>)> {
    let mut openrouter = config.openrouter.clone();
    if let Some(model) = model_override {
        openrouter.default_model = model;
    }
    let model: Arc<dyn ModelClient> = Arc::new(OpenRouterClient::new(openrouter)?);

    let servers = Arc::new(ServerRegistry::new(config.servers.clone())?);
    let task_tool = Arc::new(TaskTool::new(model.clone(), servers.clone()));

    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(config.workspace.clone()));
    registry.register(WriteFileTool::new(config.workspace.clone()));
    registry.register_arc(task_tool.clone());
    let registry = Arc::new(registry);
    task_tool.bind(registry.clone());

    for (name, discovered) in servers.discover_all().await {
        match discovered {
            Ok(tools) => registry.set_remote_tools(&name, tools),
            Err(e) => warn!("Server {} is unavailable: {}", name, e),
        }
    }

    Ok((model, registry, servers))
}

// ============================================================================
// Status Command
// ============================================================================

async fn check_status(config: Config, json: bool) -> Result<()> {
    let servers = Arc::new(ServerRegistry::new(config.servers)?);

    for (name, result) in servers.discover_all().await {
        if let Err(e) = result {
            warn!("Server {} is unavailable: {}", name, e);
        }
    }

    let status = servers.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        servers.shutdown().await;
        return Ok(());
    }

    if status.is_empty() {
        println!(
            "{} No servers configured. Add them via MCP_SERVERS or .mcprc.",
            style("ℹ").blue()
        );
        return Ok(());
    }

    println!("\n{} server(s) configured:\n", status.len());
    for server in &status {
        let mark = match server.state {
            ConnectionState::Ready => style("✓").green(),
            ConnectionState::Degraded => style("⚠").yellow(),
            ConnectionState::Closed => style("✗").red(),
            _ => style("○").dim(),
        };
        println!(
            "   {} {:<20} {:<10} {:<6} {} tool(s)",
            mark, server.name, server.state, server.transport, server.tool_count
        );
        if let Some(ref err) = server.last_error {
            println!("      └─ {}", style(err).red());
        }
    }
    println!();

    servers.shutdown().await;
    Ok(())
}

// ============================================================================
// Tools Command
// ============================================================================

async fn list_tools(config: Config, mode: PermissionMode, json: bool) -> Result<()> {
    let (_model, registry, servers) = build_runtime(&config, None).await?;

    let entries: Vec<_> = registry
        .catalog()
        .into_iter()
        .filter(|entry| mode.allows(entry.capability))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        servers.shutdown().await;
        return Ok(());
    }

    println!("\n{} tool(s) visible in {} mode:\n", entries.len(), mode);
    for entry in &entries {
        let capability = format!("{:?}", entry.capability).to_lowercase();
        println!(
            "   {:<24} {:<12} {:<14} {}",
            style(&entry.name).cyan(),
            entry.source,
            capability,
            truncate(&entry.description, 60)
        );
    }

    let shadowed = registry.shadowed();
    if !shadowed.is_empty() {
        println!();
        for shadow in &shadowed {
            println!(
                "   {} {} from {} is shadowed by {}",
                style("⚠").yellow(),
                shadow.name,
                shadow.server,
                shadow.shadowed_by
            );
        }
    }
    println!();

    servers.shutdown().await;
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max).collect();
        format!("{}...", cut)
    }
}

// ============================================================================
// Run Command
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_task(
    config: Config,
    prompt: String,
    model: Option<String>,
    mode: PermissionMode,
    system: Option<String>,
    max_turns: Option<u32>,
    quiet: bool,
    json: bool,
) -> Result<()> {
    config.validate()?;

    let (model, registry, servers) = build_runtime(&config, model).await?;

    let mut request = TaskRequest::new(prompt);
    request.permission_mode = mode;
    request.system_prompt = system;
    if let Some(turns) = max_turns {
        request.max_turns = turns;
    }

    let mut executor = TaskExecutor::new(model, registry, servers.clone());
    let mut printer = None;
    if !quiet && !json {
        let (tx, rx) = mpsc::unbounded_channel();
        executor = executor.with_events(tx);
        printer = Some(tokio::spawn(print_events(rx)));
    }

    // Ctrl-C cancels the task; in-flight work is told to stop
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = executor.run(request, cancel).await;
    drop(executor);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        servers.shutdown().await;
        return Ok(());
    }

    println!();
    match outcome.stop_reason {
        StopReason::Completed => println!("{}", outcome.response),
        reason => {
            println!("{} Task stopped: {}", style("⚠").yellow(), reason);
            if !outcome.response.is_empty() {
                println!("{}", outcome.response);
            }
        }
    }
    println!();
    println!(
        "{}",
        style(format!(
            "{} turn(s) · {} tokens · ${:.4} · {}ms in model calls",
            outcome.turns,
            outcome.ledger.total_tokens(),
            outcome.ledger.cost_usd,
            outcome.ledger.elapsed_ms
        ))
        .dim()
    );

    servers.shutdown().await;
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<TaskEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            TaskEvent::TurnStarted { turn } => {
                println!("{}", style(format!("── turn {} ──", turn)).dim());
            }
            TaskEvent::ModelResponded {
                content,
                tool_calls,
            } => {
                if !content.is_empty() {
                    println!("{}", content);
                }
                if tool_calls > 0 {
                    println!("{}", style(format!("[{} tool call(s)]", tool_calls)).dim());
                }
            }
            TaskEvent::ToolStarted { name, .. } => {
                println!("   {} {}", style("▸").cyan(), name);
            }
            TaskEvent::ToolFinished {
                name,
                success,
                elapsed_ms,
                ..
            } => {
                let mark = if success {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                println!("   {} {} ({}ms)", mark, name, elapsed_ms);
            }
            TaskEvent::TaskFinished { .. } => {}
        }
    }
}
