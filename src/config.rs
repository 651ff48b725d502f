//! Configuration management for Agentry
//!
//! Loads configuration from environment variables and `.mcprc` files.

use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Transport flavor for an external tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local subprocess speaking newline-delimited JSON-RPC on its pipes
    #[default]
    Stdio,
    /// Remote endpoint speaking JSON-RPC over HTTP POST + server-sent events
    Sse,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            _ => Err(Error::Config(format!(
                "Invalid transport type: {}. Valid options: stdio, sse",
                s
            ))),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Sse => write!(f, "sse"),
        }
    }
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// One external tool server
///
/// In `.mcprc` and `MCP_SERVERS` the records are keyed by server name, so
/// `name` is filled in from the key after parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Unique name within the registry
    #[serde(default)]
    pub name: String,
    /// Transport flavor
    #[serde(rename = "type", default)]
    pub transport: TransportKind,
    /// Command to spawn (stdio only)
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for the command
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides for the spawned process
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL (sse only)
    #[serde(default)]
    pub url: Option<String>,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Per-request deadline, e.g. "30s" or "2m"
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Whether the sse event stream attempts a bounded reconnect on drop
    #[serde(default = "default_true")]
    pub reconnect: bool,
}

impl ServerConfig {
    /// Create a stdio server record
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        ServerConfig {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            description: None,
            request_timeout: default_request_timeout(),
            reconnect: true,
        }
    }

    /// Create an sse server record
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        ServerConfig {
            name: name.into(),
            transport: TransportKind::Sse,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            description: None,
            request_timeout: default_request_timeout(),
            reconnect: true,
        }
    }

    /// Validate that the record is usable for its transport flavor
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("Server name must not be empty".to_string()));
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Config(format!(
                        "Server '{}' uses stdio transport but has no command",
                        self.name
                    )));
                }
            }
            TransportKind::Sse => {
                let raw = self.url.as_deref().unwrap_or("");
                if raw.is_empty() {
                    return Err(Error::Config(format!(
                        "Server '{}' uses sse transport but has no url",
                        self.name
                    )));
                }
                url::Url::parse(raw).map_err(|e| {
                    Error::Config(format!("Server '{}' has invalid url '{}': {}", self.name, raw, e))
                })?;
            }
        }
        Ok(())
    }
}

/// OpenRouter configuration
#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    /// API key for OpenRouter
    pub api_key: SecretString,
    /// Default model to use
    pub default_model: String,
    /// Site URL for rankings
    pub site_url: Option<String>,
    /// Site name for rankings
    pub site_name: Option<String>,
    /// Base URL for OpenRouter API
    pub base_url: String,
    /// HTTP timeout per request in seconds
    pub timeout_secs: u64,
    /// Retry attempts for transient failures
    pub max_retries: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter settings
    pub openrouter: OpenRouterConfig,
    /// External tool servers, merged from all sources
    pub servers: Vec<ServerConfig>,
    /// Root directory the file tools may touch
    pub workspace: PathBuf,
    /// Logging settings
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from environment variables and `.mcprc`
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let env_servers = std::env::var("MCP_SERVERS").ok();
        let mcprc = find_mcprc().map(std::fs::read_to_string).transpose()?;
        let servers = merge_server_sources(Vec::new(), env_servers.as_deref(), mcprc.as_deref())?;

        Ok(Config {
            openrouter: OpenRouterConfig {
                api_key: SecretString::from(
                    std::env::var("OPENROUTER_API_KEY").unwrap_or_default(),
                ),
                default_model: std::env::var("DEFAULT_MODEL")
                    .unwrap_or_else(|_| "anthropic/claude-3.5-sonnet".to_string()),
                site_url: std::env::var("OPENROUTER_SITE_URL").ok(),
                site_name: std::env::var("OPENROUTER_SITE_NAME").ok(),
                base_url: std::env::var("OPENROUTER_BASE_URL")
                    .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
                timeout_secs: std::env::var("OPENROUTER_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
                max_retries: std::env::var("OPENROUTER_MAX_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
            },
            servers,
            workspace: std::env::var("WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            log: LogConfig {
                level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agentry=debug".to_string()),
                format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            },
        })
    }

    /// Create a minimal config for testing or CLI commands that don't need full config
    pub fn minimal() -> Self {
        Config {
            openrouter: OpenRouterConfig {
                api_key: SecretString::from(""),
                default_model: "anthropic/claude-3.5-sonnet".to_string(),
                site_url: None,
                site_name: None,
                base_url: "https://openrouter.ai/api/v1".to_string(),
                timeout_secs: 120,
                max_retries: 3,
            },
            servers: Vec::new(),
            workspace: PathBuf::from("."),
            log: LogConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    /// Validate that all required configuration is present
    pub fn validate(&self) -> Result<()> {
        if self.openrouter.api_key.expose_secret().is_empty() {
            return Err(Error::Config("OPENROUTER_API_KEY is required".to_string()));
        }
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }
}

/// Locate the first `.mcprc`: working directory, then home
pub fn find_mcprc() -> Option<PathBuf> {
    let local = PathBuf::from(".mcprc");
    if local.is_file() {
        return Some(local);
    }
    let home = dirs::home_dir()?.join(".mcprc");
    if home.is_file() {
        return Some(home);
    }
    None
}

/// Server records keyed by name, rejecting duplicate keys at parse time
struct ServerMap(Vec<(String, ServerConfig)>);

impl<'de> Deserialize<'de> for ServerMap {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MapVisitor;

        impl<'de> serde::de::Visitor<'de> for MapVisitor {
            type Value = ServerMap;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of server name to server config")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut entries: Vec<(String, ServerConfig)> = Vec::new();
                while let Some((name, config)) = access.next_entry::<String, ServerConfig>()? {
                    if entries.iter().any(|(existing, _)| existing == &name) {
                        return Err(serde::de::Error::custom(format!(
                            "server '{}' is defined twice",
                            name
                        )));
                    }
                    entries.push((name, config));
                }
                Ok(ServerMap(entries))
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

/// Parse a `.mcprc`-shaped document: a json5 object keyed by server name.
///
/// A name appearing twice in one document is a hard error, unlike the
/// cross-source merge where the first source wins.
pub fn parse_server_map(content: &str) -> Result<Vec<ServerConfig>> {
    let map: ServerMap = json5::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid server configuration: {}", e)))?;

    let mut servers: Vec<ServerConfig> = map
        .0
        .into_iter()
        .map(|(name, mut config)| {
            config.name = name;
            config
        })
        .collect();
    servers.sort_by(|a, b| a.name.cmp(&b.name));

    for server in &servers {
        server.validate()?;
    }
    Ok(servers)
}

/// Merge server records from explicit values, the `MCP_SERVERS` variable,
/// and a `.mcprc` document, in that precedence order.
///
/// The first source to claim a name wins; later claims are logged and
/// dropped so a stray `.mcprc` entry cannot shadow an explicit record.
pub fn merge_server_sources(
    explicit: Vec<ServerConfig>,
    env_json: Option<&str>,
    mcprc: Option<&str>,
) -> Result<Vec<ServerConfig>> {
    let mut merged: Vec<ServerConfig> = Vec::new();
    let mut claimed: HashMap<String, &'static str> = HashMap::new();

    let sources: Vec<(&'static str, Vec<ServerConfig>)> = vec![
        ("explicit", explicit),
        (
            "MCP_SERVERS",
            env_json.map(parse_server_map).transpose()?.unwrap_or_default(),
        ),
        (
            ".mcprc",
            mcprc.map(parse_server_map).transpose()?.unwrap_or_default(),
        ),
    ];

    for (label, servers) in sources {
        for server in servers {
            server.validate()?;
            if let Some(owner) = claimed.get(&server.name) {
                warn!(
                    "Server '{}' from {} ignored: already defined by {}",
                    server.name, label, owner
                );
                continue;
            }
            debug!("Server '{}' loaded from {}", server.name, label);
            claimed.insert(server.name.clone(), label);
            merged.push(server);
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!("stdio".parse::<TransportKind>().unwrap(), TransportKind::Stdio);
        assert_eq!("sse".parse::<TransportKind>().unwrap(), TransportKind::Sse);
        assert_eq!("SSE".parse::<TransportKind>().unwrap(), TransportKind::Sse);
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_minimal_config() {
        let config = Config::minimal();
        assert!(config.validate().is_err()); // Should fail validation
    }

    #[test]
    fn test_parse_server_map_json5() {
        let content = r#"{
            // local filesystem helper
            files: {
                type: "stdio",
                command: "mcp-files",
                args: ["--root", "/tmp"],
            },
            search: {
                type: "sse",
                url: "https://search.example.com/mcp",
                request_timeout: "45s",
            },
        }"#;

        let servers = parse_server_map(content).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "files");
        assert_eq!(servers[0].transport, TransportKind::Stdio);
        assert_eq!(servers[0].command.as_deref(), Some("mcp-files"));
        assert_eq!(servers[1].name, "search");
        assert_eq!(servers[1].request_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_parse_server_map_rejects_sse_without_url() {
        let content = r#"{ broken: { type: "sse" } }"#;
        let err = parse_server_map(content).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_server_map_rejects_duplicate_names() {
        let content = r#"{
            files: { command: "mcp-files" },
            search: { type: "sse", url: "https://search.example.com/mcp" },
            files: { command: "mcp-files-v2" },
        }"#;
        let err = parse_server_map(content).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn test_parse_server_map_rejects_bad_url() {
        let content = r#"{ broken: { type: "sse", url: "not a url" } }"#;
        assert!(parse_server_map(content).is_err());
    }

    #[test]
    fn test_merge_precedence_first_wins() {
        let explicit = vec![ServerConfig::stdio("files", "local-files", vec![])];
        let env_json = r#"{ files: { command: "env-files" }, extra: { command: "extra" } }"#;
        let mcprc = r#"{ extra: { command: "rc-extra" }, third: { command: "third" } }"#;

        let merged = merge_server_sources(explicit, Some(env_json), Some(mcprc)).unwrap();
        let names: Vec<&str> = merged.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["files", "extra", "third"]);
        // explicit beat MCP_SERVERS, MCP_SERVERS beat .mcprc
        assert_eq!(merged[0].command.as_deref(), Some("local-files"));
        assert_eq!(merged[1].command.as_deref(), Some("extra"));
    }

    #[test]
    fn test_stdio_requires_command() {
        let config = ServerConfig {
            command: None,
            ..ServerConfig::stdio("nocmd", "placeholder", vec![])
        };
        assert!(config.validate().is_err());
    }
}
