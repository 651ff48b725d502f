//! Transport layer for MCP connections
//!
//! Two variants behind one trait:
//!
//! - **stdio**: a spawned subprocess speaking newline-delimited JSON-RPC on
//!   its stdin/stdout pipes
//! - **sse**: a remote endpoint accepting JSON-RPC frames over HTTP POST and
//!   delivering inbound frames on a persistent `text/event-stream` GET
//!
//! A transport moves opaque frames; correlation and protocol state live in
//! the client on top of it.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ServerConfig, TransportKind};
use crate::error::{Error, Result};

/// Maximum event-stream reconnect attempts before the transport gives up
const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Pause between reconnect attempts
const RECONNECT_PAUSE: std::time::Duration = std::time::Duration::from_millis(500);
/// How long to wait for the sse endpoint announcement
const ENDPOINT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Inbound event from a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete JSON-RPC frame
    Frame(String),
    /// The link dropped but the transport is attempting to recover.
    /// In-flight requests must be failed; new requests may still succeed.
    Interrupted { reason: String },
    /// The transport is gone for good
    Closed { reason: String },
}

/// Bidirectional frame channel to one server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one outbound frame
    async fn send(&self, frame: String) -> Result<()>;

    /// Wait for the next inbound event; `None` once the transport is torn down
    async fn receive(&self) -> Option<TransportEvent>;

    /// Tear the transport down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Build the transport described by a server config
pub async fn connect(config: &ServerConfig) -> Result<Box<dyn Transport>> {
    config.validate()?;
    match config.transport {
        TransportKind::Stdio => Ok(Box::new(StdioTransport::spawn(config).await?)),
        TransportKind::Sse => Ok(Box::new(SseTransport::connect(config).await?)),
    }
}

// ---------------------------------------------------------------------------
// stdio
// ---------------------------------------------------------------------------

/// Transport over a spawned subprocess
pub struct StdioTransport {
    name: String,
    outbound: mpsc::UnboundedSender<String>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    child: Arc<Mutex<tokio::process::Child>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Spawn the configured command and wire up its pipes
    pub async fn spawn(config: &ServerConfig) -> Result<Self> {
        let command = config.command.as_deref().ok_or_else(|| {
            Error::Config(format!("Server '{}' has no command", config.name))
        })?;

        // Resolve before spawning so a missing binary fails fast
        let resolved = which::which(command).map_err(|e| {
            Error::TransportUnavailable(format!(
                "Command '{}' for server '{}' not found: {}",
                command, config.name, e
            ))
        })?;

        debug!("Spawning MCP server '{}': {:?} {:?}", config.name, resolved, config.args);

        let mut cmd = Command::new(&resolved);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::TransportUnavailable(format!(
                "Failed to spawn server '{}': {}",
                config.name, e
            ))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::TransportUnavailable(format!("Failed to capture stdin of '{}'", config.name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::TransportUnavailable(format!("Failed to capture stdout of '{}'", config.name))
        })?;
        let stderr = child.stderr.take();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Writer task: one frame per line, newline-terminated
        tokio::spawn(async move {
            let mut writer = stdin;
            while let Some(frame) = out_rx.recv().await {
                // A frame must stay on a single line
                let frame = frame.replace('\n', "");
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Stderr task: surface server logs without mixing them into frames
        if let Some(stderr) = stderr {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{} stderr] {}", name, line);
                }
            });
        }

        let child = Arc::new(Mutex::new(child));

        // Reader task: newline-delimited frames until EOF, then exit capture
        let reader_child = child.clone();
        let name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if event_tx.send(TransportEvent::Frame(line.to_string())).is_err() {
                    return;
                }
            }
            let reason = match reader_child.lock().await.wait().await {
                Ok(status) => format!("server '{}' exited with {}", name, status),
                Err(e) => format!("server '{}' unreachable: {}", name, e),
            };
            let _ = event_tx.send(TransportEvent::Closed { reason });
        });

        Ok(StdioTransport {
            name: config.name.clone(),
            outbound: out_tx,
            events: Mutex::new(event_rx),
            child,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: String) -> Result<()> {
        self.outbound.send(frame).map_err(|_| {
            Error::TransportUnavailable(format!("stdin of server '{}' is closed", self.name))
        })
    }

    async fn receive(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            // Already exited
            debug!("Kill for server '{}' returned: {}", self.name, e);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// sse
// ---------------------------------------------------------------------------

/// Transport over an HTTP POST + server-sent-events pair.
///
/// The GET stream announces the POST endpoint in its first `endpoint` event;
/// subsequent `message` events carry inbound JSON-RPC frames.
pub struct SseTransport {
    name: String,
    http: reqwest::Client,
    post_url: Arc<RwLock<Option<Url>>>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    closed: Arc<AtomicBool>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    /// Open the event stream and wait for the endpoint announcement
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let raw_url = config.url.as_deref().ok_or_else(|| {
            Error::Config(format!("Server '{}' has no url", config.name))
        })?;
        let base = Url::parse(raw_url)
            .map_err(|e| Error::Config(format!("Server '{}' has invalid url: {}", config.name, e)))?;

        // Only the connect phase is bounded; an overall timeout would
        // sever the long-lived GET stream.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::TransportUnavailable(format!("HTTP client setup failed: {}", e)))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Result<Url>>();
        let post_url = Arc::new(RwLock::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(run_event_stream(
            http.clone(),
            base,
            config.name.clone(),
            config.reconnect,
            event_tx,
            endpoint_tx,
            post_url.clone(),
            closed.clone(),
        ));

        // The server must announce its POST endpoint before we can speak
        match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(Ok(url))) => {
                debug!("Server '{}' announced endpoint {}", config.name, url);
            }
            Ok(Ok(Err(e))) => {
                pump.abort();
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                pump.abort();
                return Err(Error::TransportUnavailable(format!(
                    "Server '{}' did not announce an endpoint within {:?}",
                    config.name, ENDPOINT_TIMEOUT
                )));
            }
        }

        Ok(SseTransport {
            name: config.name.clone(),
            http,
            post_url,
            events: Mutex::new(event_rx),
            closed,
            pump: std::sync::Mutex::new(Some(pump)),
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, frame: String) -> Result<()> {
        let url = self.post_url.read().await.clone().ok_or_else(|| {
            Error::TransportUnavailable(format!("server '{}' has no active endpoint", self.name))
        })?;

        let response = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(frame)
            .send()
            .await
            .map_err(|e| {
                Error::TransportUnavailable(format!("POST to server '{}' failed: {}", self.name, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::TransportUnavailable(format!(
                "Server '{}' rejected frame: {}",
                self.name, status
            )));
        }
        Ok(())
    }

    async fn receive(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }
}

/// Drive the GET event stream, reconnecting within bounds
#[allow(clippy::too_many_arguments)]
async fn run_event_stream(
    http: reqwest::Client,
    base: Url,
    name: String,
    reconnect: bool,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    endpoint_tx: oneshot::Sender<Result<Url>>,
    post_url: Arc<RwLock<Option<Url>>>,
    closed: Arc<AtomicBool>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut attempts: u32 = 0;

    loop {
        let reason = pump_one_stream(&http, &base, &name, &event_tx, &mut endpoint_tx, &post_url).await;

        if closed.load(Ordering::SeqCst) {
            return;
        }

        // Without an announced endpoint there is no session to resume
        let connect_phase = endpoint_tx.is_some();

        if connect_phase || !reconnect || attempts >= MAX_RECONNECT_ATTEMPTS {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(Err(Error::TransportUnavailable(format!(
                    "Server '{}': {}",
                    name, reason
                ))));
            }
            let _ = event_tx.send(TransportEvent::Closed { reason });
            return;
        }

        attempts += 1;
        warn!(
            "Event stream to '{}' dropped ({}), reconnect attempt {}/{}",
            name, reason, attempts, MAX_RECONNECT_ATTEMPTS
        );
        let _ = event_tx.send(TransportEvent::Interrupted {
            reason: reason.clone(),
        });
        tokio::time::sleep(RECONNECT_PAUSE).await;
    }
}

/// Run one GET stream to completion; returns the reason it ended
async fn pump_one_stream(
    http: &reqwest::Client,
    base: &Url,
    name: &str,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    endpoint_tx: &mut Option<oneshot::Sender<Result<Url>>>,
    post_url: &Arc<RwLock<Option<Url>>>,
) -> String {
    let response = match http
        .get(base.clone())
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return format!("event stream connect failed: {}", e),
    };

    if !response.status().is_success() {
        return format!("event stream returned {}", response.status());
    }

    let mut stream = response.bytes_stream();
    let mut parser = SseParser::default();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => return format!("event stream read failed: {}", e),
        };
        for event in parser.push(&bytes) {
            match event.name.as_str() {
                "endpoint" => match base.join(event.data.trim()) {
                    Ok(url) => {
                        *post_url.write().await = Some(url.clone());
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(Ok(url));
                        }
                    }
                    Err(e) => {
                        return format!("invalid endpoint '{}': {}", event.data.trim(), e);
                    }
                },
                "message" => {
                    if event_tx.send(TransportEvent::Frame(event.data)).is_err() {
                        return "receiver dropped".to_string();
                    }
                }
                other => {
                    debug!("Ignoring event '{}' from server '{}'", other, name);
                }
            }
        }
    }

    "event stream ended".to_string()
}

/// One parsed server-sent event
#[derive(Debug, PartialEq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental parser for `text/event-stream` bytes
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    /// Feed a chunk, yielding every event completed by it
    fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.data.is_empty() || !self.event.is_empty() {
                    let name = if self.event.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event)
                    };
                    events.push(SseEvent {
                        name,
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if line.starts_with(':') {
                // keep-alive comment
            }
        }

        events
    }
}
