//! Server registry: owns one connection per configured MCP server
//!
//! Servers are registered eagerly from config but started lazily, so a
//! misconfigured server costs nothing until something actually needs it.
//! A server that degrades or fails to start stays that way until an
//! explicit [`restart`](ServerRegistry::restart); failures never spread
//! to sibling servers.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{ConnectionState, McpClient};
use super::protocol::{McpTool, McpToolResult};
use super::transport;
use crate::config::{ServerConfig, TransportKind};
use crate::error::{Error, Result};

/// Point-in-time view of one server, cheap enough for a status command
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub last_error: Option<String>,
}

struct ServerEntry {
    config: ServerConfig,
    /// Serializes start and restart so only one handshake runs per server
    start_lock: tokio::sync::Mutex<()>,
    client: StdRwLock<Option<Arc<McpClient>>>,
    /// Most recent discovery snapshot
    tools: StdRwLock<Vec<McpTool>>,
    last_error: StdMutex<Option<String>>,
    start_failed: AtomicBool,
}

impl ServerEntry {
    fn new(config: ServerConfig) -> Self {
        ServerEntry {
            config,
            start_lock: tokio::sync::Mutex::new(()),
            client: StdRwLock::new(None),
            tools: StdRwLock::new(Vec::new()),
            last_error: StdMutex::new(None),
            start_failed: AtomicBool::new(false),
        }
    }

    fn current_client(&self) -> Option<Arc<McpClient>> {
        self.client.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_failure(&self, err: &Error) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
        self.start_failed.store(true, Ordering::SeqCst);
    }

    fn clear_failure(&self) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.start_failed.store(false, Ordering::SeqCst);
    }
}

/// Registry of configured MCP servers
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerEntry>,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.names())
            .finish()
    }
}

impl ServerRegistry {
    /// Register servers from config without starting any of them.
    ///
    /// Rejects invalid configs and duplicate names up front.
    pub fn new(configs: Vec<ServerConfig>) -> Result<Self> {
        let mut servers = BTreeMap::new();
        for config in configs {
            config.validate()?;
            let name = config.name.clone();
            if servers.contains_key(&name) {
                return Err(Error::Config(format!(
                    "duplicate MCP server name '{}'",
                    name
                )));
            }
            servers.insert(name, ServerEntry::new(config));
        }
        Ok(ServerRegistry { servers })
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Registered server names, sorted
    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Start the server if this is its first use, and return its client.
    ///
    /// A server that already failed or degraded is refused here; only
    /// [`restart`](Self::restart) gives it another chance.
    pub async fn ensure_started(&self, name: &str) -> Result<Arc<McpClient>> {
        let entry = self.entry(name)?;

        if let Some(client) = entry.current_client() {
            return match client.state() {
                ConnectionState::Ready => Ok(client),
                other => Err(Error::ServerUnavailable(format!(
                    "server '{}' is {}",
                    name, other
                ))),
            };
        }

        let _guard = entry.start_lock.lock().await;

        // Someone else may have started it while we waited
        if let Some(client) = entry.current_client() {
            return match client.state() {
                ConnectionState::Ready => Ok(client),
                other => Err(Error::ServerUnavailable(format!(
                    "server '{}' is {}",
                    name, other
                ))),
            };
        }
        if entry.start_failed.load(Ordering::SeqCst) {
            let detail = entry
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::ServerUnavailable(format!(
                "server '{}' failed to start: {}",
                name, detail
            )));
        }

        match start_client(&entry.config).await {
            Ok(client) => {
                *entry.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());
                entry.clear_failure();
                Ok(client)
            }
            Err(e) => {
                warn!("Server '{}' failed to start: {}", name, e);
                entry.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Fetch the server's tool list and cache the snapshot
    pub async fn discover(&self, name: &str) -> Result<Vec<McpTool>> {
        let entry = self.entry(name)?;
        let client = self.ensure_started(name).await?;
        let tools = client.list_tools().await?;
        *entry.tools.write().unwrap_or_else(|e| e.into_inner()) = tools.clone();
        info!("Discovered {} tools on server '{}'", tools.len(), name);
        Ok(tools)
    }

    /// Discover every server, keeping failures isolated per server
    pub async fn discover_all(&self) -> Vec<(String, Result<Vec<McpTool>>)> {
        let mut results = Vec::with_capacity(self.servers.len());
        for name in self.names() {
            let result = self.discover(&name).await;
            if let Err(e) = &result {
                warn!("Discovery on server '{}' failed: {}", name, e);
            }
            results.push((name, result));
        }
        results
    }

    /// Invoke a tool on a specific server
    pub async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<McpToolResult> {
        let client = self.ensure_started(server).await?;
        client.invoke(tool, arguments, deadline, cancel).await
    }

    /// Tear the connection down and bring the server back up from scratch.
    ///
    /// Returns the fresh tool list so the caller can replace its catalog.
    pub async fn restart(&self, name: &str) -> Result<Vec<McpTool>> {
        let entry = self.entry(name)?;
        let _guard = entry.start_lock.lock().await;

        if let Some(old) = entry
            .client
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = old.close().await;
        }
        entry.tools.write().unwrap_or_else(|e| e.into_inner()).clear();
        entry.clear_failure();
        info!("Restarting MCP server '{}'", name);

        let client = match start_client(&entry.config).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Server '{}' failed to restart: {}", name, e);
                entry.record_failure(&e);
                return Err(e);
            }
        };
        *entry.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                entry.record_failure(&e);
                return Err(e);
            }
        };
        *entry.tools.write().unwrap_or_else(|e| e.into_inner()) = tools.clone();
        info!("Server '{}' restarted with {} tools", name, tools.len());
        Ok(tools)
    }

    /// Snapshot every server's state without touching the network
    pub fn status(&self) -> Vec<ServerStatus> {
        self.servers
            .iter()
            .map(|(name, entry)| {
                let state = match entry.current_client() {
                    Some(client) => client.state(),
                    None if entry.start_failed.load(Ordering::SeqCst) => ConnectionState::Closed,
                    None => ConnectionState::Uninitialized,
                };
                ServerStatus {
                    name: name.clone(),
                    transport: entry.config.transport,
                    state,
                    tool_count: entry.tools.read().unwrap_or_else(|e| e.into_inner()).len(),
                    last_error: entry
                        .last_error
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone(),
                }
            })
            .collect()
    }

    /// Close every connection. The registry is not usable afterwards.
    pub async fn shutdown(&self) {
        for (name, entry) in &self.servers {
            let client = entry
                .client
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(client) = client {
                if let Err(e) = client.close().await {
                    debug!("Closing server '{}': {}", name, e);
                }
            }
        }
        debug!("All MCP servers shut down");
    }

    fn entry(&self, name: &str) -> Result<&ServerEntry> {
        self.servers
            .get(name)
            .ok_or_else(|| Error::ServerUnavailable(format!("unknown MCP server '{}'", name)))
    }
}

async fn start_client(config: &ServerConfig) -> Result<Arc<McpClient>> {
    info!(
        "Starting MCP server '{}' over {}",
        config.name, config.transport
    );
    let transport = transport::connect(config).await?;
    let client = Arc::new(McpClient::new(
        &config.name,
        transport,
        config.request_timeout,
    ));
    client.connect().await?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(name: &str, command: &str) -> ServerConfig {
        ServerConfig::stdio(name, command, Vec::new())
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let configs = vec![
            stdio_config("files", "mcp-files"),
            stdio_config("files", "mcp-files-v2"),
        ];
        let err = ServerRegistry::new(configs).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = stdio_config("broken", "cmd");
        config.command = None;
        let err = ServerRegistry::new(vec![config]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_status_before_any_start_is_all_uninitialized() {
        let configs = vec![
            stdio_config("zeta", "mcp-zeta"),
            stdio_config("alpha", "mcp-alpha"),
            ServerConfig::sse("remote", "https://mcp.example.com/sse"),
        ];
        let registry = ServerRegistry::new(configs).unwrap();

        let status = registry.status();
        assert_eq!(status.len(), 3);
        // Sorted by name, nothing started
        assert_eq!(status[0].name, "alpha");
        assert_eq!(status[1].name, "remote");
        assert_eq!(status[2].name, "zeta");
        for entry in &status {
            assert_eq!(entry.state, ConnectionState::Uninitialized);
            assert_eq!(entry.tool_count, 0);
            assert!(entry.last_error.is_none());
        }
        assert_eq!(status[1].transport, TransportKind::Sse);
    }

    #[test]
    fn test_registry_debug_lists_server_names() {
        let registry = ServerRegistry::new(vec![
            stdio_config("alpha", "mcp-alpha"),
            stdio_config("beta", "mcp-beta"),
        ])
        .unwrap();
        let rendered = format!("{:?}", registry);
        assert!(rendered.contains("alpha"));
        assert!(rendered.contains("beta"));
    }

    #[tokio::test]
    async fn test_unknown_server_is_refused() {
        let registry = ServerRegistry::new(vec![stdio_config("known", "mcp-known")]).unwrap();
        let err = registry.ensure_started("mystery").await.unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));
        assert!(err.to_string().contains("mystery"));
    }

    #[tokio::test]
    async fn test_failed_start_is_sticky_until_restart() {
        let registry = ServerRegistry::new(vec![stdio_config(
            "ghost",
            "agentry-test-binary-that-does-not-exist",
        )])
        .unwrap();

        let err = registry.ensure_started("ghost").await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));

        let status = registry.status();
        assert_eq!(status[0].state, ConnectionState::Closed);
        assert!(status[0].last_error.is_some());

        // Second attempt is refused without retrying the spawn
        let err = registry.ensure_started("ghost").await.unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));

        // Restart retries (and fails the same way here)
        let err = registry.restart("ghost").await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invoke_on_failed_server_propagates_unavailable() {
        let registry = ServerRegistry::new(vec![stdio_config(
            "ghost",
            "agentry-test-binary-that-does-not-exist",
        )])
        .unwrap();

        let cancel = CancellationToken::new();
        let err = registry
            .invoke(
                "ghost",
                "anything",
                serde_json::json!({}),
                Duration::from_secs(1),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
    }
}
