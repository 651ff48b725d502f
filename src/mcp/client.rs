//! MCP client: handshake, correlation, and invocation over a transport
//!
//! One client owns one transport. Outbound requests carry ids from an
//! atomic counter; a reader task routes inbound frames to the matching
//! waiter, so any number of invocations can be in flight on the same
//! connection without cross-delivery.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{
    InitializeResult, ListToolsResult, McpNotification, McpRequest, McpResponse, McpTool,
    McpToolResult,
};
use super::transport::{Transport, TransportEvent};
use crate::error::{Error, Result};

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Constructed, nothing sent yet
    Uninitialized,
    /// Initialize exchange in flight
    Handshaking,
    /// Discovered and usable
    Ready,
    /// Transport lost mid-session; not auto-healed
    Degraded,
    /// Explicitly closed, terminal
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Uninitialized => write!(f, "uninitialized"),
            ConnectionState::Handshaking => write!(f, "handshaking"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Degraded => write!(f, "degraded"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<McpResponse>>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<McpResponse>>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_state(state: &StdRwLock<ConnectionState>) -> ConnectionState {
    *state.read().unwrap_or_else(|e| e.into_inner())
}

fn set_state(state: &StdRwLock<ConnectionState>, next: ConnectionState) {
    *state.write().unwrap_or_else(|e| e.into_inner()) = next;
}

/// Fail every outstanding request, each with its own error
fn fail_pending_with<F: Fn(u64) -> Error>(pending: &PendingMap, make: F) {
    let drained: Vec<(u64, oneshot::Sender<Result<McpResponse>>)> =
        lock_pending(pending).drain().collect();
    for (id, tx) in drained {
        let _ = tx.send(Err(make(id)));
    }
}

/// Removes the pending entry when a request future is dropped, so a timed
/// out or cancelled request cannot leak its correlation slot.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

/// MCP client for communicating with one MCP server
pub struct McpClient {
    /// Server name
    name: String,
    /// Frame channel
    transport: Arc<dyn Transport>,
    /// Outstanding requests awaiting a response
    pending: PendingMap,
    /// Request ID counter
    next_id: AtomicU64,
    /// Connection lifecycle
    state: Arc<StdRwLock<ConnectionState>>,
    /// Capabilities cached from the initialize exchange
    server_info: StdRwLock<Option<InitializeResult>>,
    /// Per-request deadline
    request_timeout: Duration,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &lock_pending(&self.pending).len())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Wrap a transport and start routing its inbound frames.
    ///
    /// The connection is not usable until [`connect`](Self::connect) has
    /// completed the handshake.
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let state = Arc::new(StdRwLock::new(ConnectionState::Uninitialized));

        let reader_transport = transport.clone();
        let reader_pending = pending.clone();
        let reader_state = state.clone();
        let reader_name = name.clone();
        tokio::spawn(async move {
            run_reader(reader_transport, reader_pending, reader_state, reader_name).await;
        });

        McpClient {
            name,
            transport,
            pending,
            next_id: AtomicU64::new(1),
            state,
            server_info: StdRwLock::new(None),
            request_timeout,
        }
    }

    /// Get the server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        read_state(&self.state)
    }

    /// Capabilities declared by the server, once ready
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Perform the initialize handshake.
    ///
    /// Bounded by the per-request deadline; any failure here closes the
    /// connection for good.
    pub async fn connect(&self) -> Result<InitializeResult> {
        if self.state() != ConnectionState::Uninitialized {
            return Err(Error::Internal(format!(
                "connect() called twice on server '{}'",
                self.name
            )));
        }
        set_state(&self.state, ConnectionState::Handshaking);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = match self.request(McpRequest::initialize(id)).await {
            Ok(r) => r,
            Err(e) => return Err(self.fail_handshake(e).await),
        };

        if let Some(err) = response.error {
            return Err(self
                .fail_handshake(Error::Rpc {
                    code: err.code,
                    message: err.message,
                })
                .await);
        }

        let init: InitializeResult =
            match serde_json::from_value(response.result.unwrap_or_default()) {
                Ok(init) => init,
                Err(e) => {
                    return Err(self
                        .fail_handshake(Error::Framing(format!(
                            "malformed initialize result from '{}': {}",
                            self.name, e
                        )))
                        .await);
                }
            };

        let note = serde_json::to_string(&McpNotification::initialized())?;
        if let Err(e) = self.transport.send(note).await {
            return Err(self.fail_handshake(e).await);
        }

        *self.server_info.write().unwrap_or_else(|e| e.into_inner()) = Some(init.clone());
        set_state(&self.state, ConnectionState::Ready);

        let server_name = init
            .server_info
            .as_ref()
            .map(|s| s.name.as_str())
            .unwrap_or("unknown");
        info!(
            "Server '{}' ready: {} (protocol {})",
            self.name, server_name, init.protocol_version
        );
        Ok(init)
    }

    /// List the server's tools, following pagination cursors
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        self.ensure_ready()?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let response = self
                .request(McpRequest::list_tools(id, cursor.as_deref()))
                .await?;
            if let Some(err) = response.error {
                return Err(Error::Rpc {
                    code: err.code,
                    message: err.message,
                });
            }
            let page: ListToolsResult =
                serde_json::from_value(response.result.unwrap_or_default()).map_err(|e| {
                    Error::Framing(format!(
                        "malformed tools/list result from '{}': {}",
                        self.name, e
                    ))
                })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!("Server '{}' lists {} tools", self.name, tools.len());
        Ok(tools)
    }

    /// Call a tool, bounded by `deadline` and the caller's cancellation token.
    ///
    /// Resolves exactly once: result, server error, timeout, or cancelled.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<McpToolResult> {
        self.ensure_ready()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = McpRequest::call_tool(id, tool, arguments);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.request_with_deadline(request, deadline) => Some(res),
        };

        let response = match outcome {
            None => {
                self.notify_cancelled(id, "cancelled by caller").await;
                return Err(Error::Cancelled(format!(
                    "invocation of '{}' on server '{}'",
                    tool, self.name
                )));
            }
            Some(Err(Error::Timeout(msg))) => {
                // Tell the server to stop working on it; we no longer listen
                self.notify_cancelled(id, "deadline elapsed").await;
                return Err(Error::Timeout(msg));
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(response)) => response,
        };

        if let Some(err) = response.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        let result: McpToolResult = serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|e| {
                Error::Framing(format!(
                    "malformed tools/call result from '{}': {}",
                    self.name, e
                ))
            })?;
        if result.is_error {
            warn!("Tool '{}' on server '{}' reported an error", tool, self.name);
        }
        Ok(result)
    }

    /// Abandon an in-flight request and tell the server, best effort.
    ///
    /// The local waiter resolves as cancelled; the server may or may not
    /// actually abort.
    pub async fn cancel(&self, request_id: u64, reason: &str) {
        if lock_pending(&self.pending).remove(&request_id).is_some() {
            debug!(
                "Cancelled pending request {} on server '{}'",
                request_id, self.name
            );
        }
        self.notify_cancelled(request_id, reason).await;
    }

    /// Close the connection. Terminal and idempotent.
    pub async fn close(&self) -> Result<()> {
        set_state(&self.state, ConnectionState::Closed);
        fail_pending_with(&self.pending, |id| {
            Error::ServerUnavailable(format!("request {} aborted: connection closed", id))
        });
        self.transport.close().await
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            other => Err(Error::ServerUnavailable(format!(
                "server '{}' is {}",
                self.name, other
            ))),
        }
    }

    async fn fail_handshake(&self, err: Error) -> Error {
        set_state(&self.state, ConnectionState::Closed);
        let _ = self.transport.close().await;
        err
    }

    async fn request(&self, request: McpRequest) -> Result<McpResponse> {
        self.request_with_deadline(request, self.request_timeout)
            .await
    }

    /// Send one request and wait for its correlated response
    async fn request_with_deadline(
        &self,
        request: McpRequest,
        deadline: Duration,
    ) -> Result<McpResponse> {
        let id = request.id;
        let method = request.method.clone();

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        let frame = serde_json::to_string(&request)?;
        debug!("MCP request -> {}: {}", self.name, frame);

        // The deadline covers the send too; a wedged transport write must
        // not stretch an invocation past its budget.
        let exchange = async {
            self.transport.send(frame).await?;
            match rx.await {
                Ok(delivered) => delivered,
                Err(_) => Err(Error::Cancelled(format!(
                    "request '{}' ({}) to server '{}'",
                    method, id, self.name
                ))),
            }
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "request '{}' ({}) to server '{}' after {:?}",
                method, id, self.name, deadline
            ))),
        }
    }

    async fn notify_cancelled(&self, request_id: u64, reason: &str) {
        let note = McpNotification::cancelled(request_id, reason);
        if let Ok(frame) = serde_json::to_string(&note) {
            if let Err(e) = self.transport.send(frame).await {
                debug!(
                    "Cancellation notice for request {} not delivered: {}",
                    request_id, e
                );
            }
        }
    }
}

/// Route inbound frames until the transport ends
async fn run_reader(
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    state: Arc<StdRwLock<ConnectionState>>,
    name: String,
) {
    loop {
        match transport.receive().await {
            Some(TransportEvent::Frame(line)) => {
                route_frame(&name, &line, &pending, &state);
            }
            Some(TransportEvent::Interrupted { reason }) => {
                warn!(
                    "Transport to server '{}' interrupted: {}; failing in-flight requests",
                    name, reason
                );
                fail_pending_with(&pending, |id| {
                    Error::ServerUnavailable(format!("request {} aborted: {}", id, reason))
                });
            }
            Some(TransportEvent::Closed { reason }) => {
                finish_reader(&pending, &state, &name, &reason);
                return;
            }
            None => {
                finish_reader(&pending, &state, &name, "transport ended");
                return;
            }
        }
    }
}

fn finish_reader(
    pending: &PendingMap,
    state: &Arc<StdRwLock<ConnectionState>>,
    name: &str,
    reason: &str,
) {
    if read_state(state) != ConnectionState::Closed {
        set_state(state, ConnectionState::Degraded);
        warn!("Server '{}' degraded: {}", name, reason);
    }
    fail_pending_with(pending, |id| {
        Error::ServerUnavailable(format!("request {} aborted: {}", id, reason))
    });
}

fn route_frame(
    name: &str,
    line: &str,
    pending: &PendingMap,
    state: &Arc<StdRwLock<ConnectionState>>,
) {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            if read_state(state) == ConnectionState::Handshaking {
                // A server that cannot frame its handshake is unusable
                fail_pending_with(pending, |_| {
                    Error::Framing(format!("malformed handshake frame from '{}': {}", name, e))
                });
            } else {
                debug!("Skipping malformed frame from '{}': {}", name, e);
            }
            return;
        }
    };

    let id = match parsed.get("id").and_then(|v| v.as_u64()) {
        Some(id) => id,
        None => {
            let method = parsed
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown");
            debug!("Notification '{}' from server '{}'", method, name);
            return;
        }
    };

    let sender = lock_pending(pending).remove(&id);
    match sender {
        Some(tx) => {
            let delivered = serde_json::from_value::<McpResponse>(parsed).map_err(|e| {
                Error::Framing(format!("malformed response {} from '{}': {}", id, name, e))
            });
            let _ = tx.send(delivered);
        }
        None => {
            debug!("Discarding response for unknown id {} from '{}'", id, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    type Responder = Box<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

    struct MockTransport {
        sent: Arc<StdMutex<Vec<String>>>,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
        inject: mpsc::UnboundedSender<TransportEvent>,
        responder: Responder,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, frame: String) -> Result<()> {
            self.sent.lock().unwrap().push(frame.clone());
            if let Ok(value) = serde_json::from_str::<Value>(&frame) {
                if let Some(reply) = (self.responder)(&value) {
                    let _ = self.inject.send(TransportEvent::Frame(reply.to_string()));
                }
            }
            Ok(())
        }

        async fn receive(&self) -> Option<TransportEvent> {
            self.inbound.lock().await.recv().await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn mock_transport(
        responder: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> (
        Box<dyn Transport>,
        Arc<StdMutex<Vec<String>>>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let transport = MockTransport {
            sent: sent.clone(),
            inbound: tokio::sync::Mutex::new(rx),
            inject: tx.clone(),
            responder: Box::new(responder),
        };
        (Box::new(transport), sent, tx)
    }

    fn init_reply(request: &Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "mock-server", "version": "1.0.0" }
            }
        })
    }

    /// Answers the handshake, then delegates tool traffic
    fn with_handshake(
        on_request: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> impl Fn(&Value) -> Option<Value> + Send + Sync + 'static {
        move |request: &Value| match request.get("method").and_then(|m| m.as_str()) {
            Some("initialize") => Some(init_reply(request)),
            Some("notifications/initialized") | Some("notifications/cancelled") => None,
            _ => on_request(request),
        }
    }

    fn tool_call_reply(request: &Value, text: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "content": [{ "type": "text", "text": text }],
                "isError": false
            }
        })
    }

    async fn ready_client(
        responder: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> (
        McpClient,
        Arc<StdMutex<Vec<String>>>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (transport, sent, inject) = mock_transport(with_handshake(responder));
        let client = McpClient::new("mock", transport, Duration::from_millis(500));
        client.connect().await.unwrap();
        (client, sent, inject)
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready_and_caches_capabilities() {
        let (client, sent, _inject) = ready_client(|_| None).await;

        assert_eq!(client.state(), ConnectionState::Ready);
        let info = client.server_info().unwrap();
        assert_eq!(info.protocol_version, "2024-11-05");
        assert_eq!(info.server_info.unwrap().name, "mock-server");

        let frames = sent.lock().unwrap();
        assert!(frames[0].contains("\"initialize\""));
        assert!(frames[1].contains("notifications/initialized"));
    }

    #[tokio::test]
    async fn test_client_debug_shows_name_and_state() {
        let (client, _sent, _inject) = ready_client(|_| None).await;
        let rendered = format!("{:?}", client);
        assert!(rendered.contains("mock"));
        assert!(rendered.contains("Ready"));
    }

    /// Transport whose tools/call send never completes
    struct StallingTransport {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
        inject: mpsc::UnboundedSender<TransportEvent>,
    }

    #[async_trait]
    impl Transport for StallingTransport {
        async fn send(&self, frame: String) -> Result<()> {
            if let Ok(value) = serde_json::from_str::<Value>(&frame) {
                match value.get("method").and_then(|m| m.as_str()) {
                    Some("initialize") => {
                        let _ = self
                            .inject
                            .send(TransportEvent::Frame(init_reply(&value).to_string()));
                    }
                    Some("tools/call") => {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    }
                    _ => {}
                }
            }
            Ok(())
        }

        async fn receive(&self) -> Option<TransportEvent> {
            self.inbound.lock().await.recv().await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_deadline_bounds_a_stalled_send() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = StallingTransport {
            inbound: tokio::sync::Mutex::new(rx),
            inject: tx,
        };
        let client = McpClient::new("stalled", Box::new(transport), Duration::from_secs(5));
        client.connect().await.unwrap();

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let err = client
            .invoke("wedged", json!({}), Duration::from_millis(100), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_terminal() {
        // Responder swallows everything, including initialize
        let (transport, _sent, _inject) = mock_transport(|_| None);
        let client = McpClient::new("mute", transport, Duration::from_millis(50));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(client.state(), ConnectionState::Closed);

        // The connection stays unusable
        let cancel = CancellationToken::new();
        let err = client
            .invoke("anything", json!({}), Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invoke_timeout_removes_pending_and_notifies() {
        let (client, sent, _inject) = ready_client(|request| {
            match request.get("method").and_then(|m| m.as_str()) {
                Some("tools/call") => None, // never answer
                _ => None,
            }
        })
        .await;

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let err = client
            .invoke("slow", json!({}), Duration::from_millis(80), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        let frames = sent.lock().unwrap();
        assert!(frames.iter().any(|f| f.contains("notifications/cancelled")));
    }

    #[tokio::test]
    async fn test_cancellation_token_converts_to_cancelled() {
        let (client, sent, _inject) = ready_client(|_| None).await;

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_clone.cancel();
        });

        let err = client
            .invoke("slow", json!({}), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        let frames = sent.lock().unwrap();
        assert!(frames.iter().any(|f| f.contains("notifications/cancelled")));
    }

    #[tokio::test]
    async fn test_concurrent_invocations_do_not_cross_deliver() {
        // Tool calls are answered manually, out of request order
        let (client, sent, inject) = ready_client(|_| None).await;
        let client = Arc::new(client);

        let cancel = CancellationToken::new();
        let first = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .invoke("alpha", json!({"n": 1}), Duration::from_secs(5), &cancel)
                    .await
            })
        };
        let second = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .invoke("beta", json!({"n": 2}), Duration::from_secs(5), &cancel)
                    .await
            })
        };

        // Wait until both tools/call frames are on the wire
        let calls = loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let frames = sent.lock().unwrap();
            let calls: Vec<Value> = frames
                .iter()
                .filter_map(|f| serde_json::from_str::<Value>(f).ok())
                .filter(|v| v["method"] == "tools/call")
                .collect();
            if calls.len() == 2 {
                break calls;
            }
        };

        // Reply in reverse order, naming the tool each response belongs to
        for call in calls.iter().rev() {
            let tool = call["params"]["name"].as_str().unwrap().to_string();
            inject
                .send(TransportEvent::Frame(
                    tool_call_reply(call, &format!("result-for-{}", tool)).to_string(),
                ))
                .unwrap();
        }

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.text(), "result-for-alpha");
        assert_eq!(second.text(), "result-for-beta");
    }

    #[tokio::test]
    async fn test_explicit_cancel_resolves_the_waiter() {
        let (client, sent, _inject) = ready_client(|_| None).await;
        let client = Arc::new(client);

        let cancel = CancellationToken::new();
        let in_flight = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .invoke("abandoned", json!({}), Duration::from_secs(5), &cancel)
                    .await
            })
        };

        // Find the request id that went out for the call
        let id = loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let frames = sent.lock().unwrap();
            let call = frames
                .iter()
                .filter_map(|f| serde_json::from_str::<Value>(f).ok())
                .find(|v| v["method"] == "tools/call");
            if let Some(call) = call {
                break call["id"].as_u64().unwrap();
            }
        };

        client.cancel(id, "operator abort").await;
        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        let frames = sent.lock().unwrap();
        assert!(frames.iter().any(|f| f.contains("notifications/cancelled")));
        drop(frames);
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_late_response_for_unknown_id_is_discarded() {
        let (client, _sent, inject) = ready_client(|request| {
            match request.get("method").and_then(|m| m.as_str()) {
                Some("tools/call") => Some(tool_call_reply(request, "fine")),
                _ => None,
            }
        })
        .await;

        inject
            .send(TransportEvent::Frame(
                json!({"jsonrpc": "2.0", "id": 9999, "result": {}}).to_string(),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The connection is unaffected
        let cancel = CancellationToken::new();
        let result = client
            .invoke("probe", json!({}), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(result.text(), "fine");
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_transport_closed_degrades_and_fails_pending() {
        let (client, _sent, inject) = ready_client(|_| None).await;
        let client = Arc::new(client);

        let cancel = CancellationToken::new();
        let in_flight = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .invoke("doomed", json!({}), Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        inject
            .send(TransportEvent::Closed {
                reason: "process exited".to_string(),
            })
            .unwrap();

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state(), ConnectionState::Degraded);

        // New invocations are refused without touching the wire
        let err = client
            .invoke("next", json!({}), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_rpc() {
        let (client, _sent, _inject) = ready_client(|request| {
            match request.get("method").and_then(|m| m.as_str()) {
                Some("tools/call") => Some(json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": { "code": -32602, "message": "bad params" }
                })),
                _ => None,
            }
        })
        .await;

        let cancel = CancellationToken::new();
        let err = client
            .invoke("strict", json!({}), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad params");
            }
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let (client, _sent, _inject) = ready_client(|request| {
            match request.get("method").and_then(|m| m.as_str()) {
                Some("tools/list") => {
                    let cursor = request["params"]["cursor"].as_str();
                    let page = match cursor {
                        None => json!({
                            "tools": [{ "name": "one", "inputSchema": { "type": "object" } }],
                            "nextCursor": "page2"
                        }),
                        Some("page2") => json!({
                            "tools": [{ "name": "two", "inputSchema": { "type": "object" } }]
                        }),
                        Some(other) => panic!("unexpected cursor {}", other),
                    };
                    Some(json!({ "jsonrpc": "2.0", "id": request["id"], "result": page }))
                }
                _ => None,
            }
        })
        .await;

        let tools = client.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_list_tools_is_stable_across_calls() {
        let (client, _sent, _inject) = ready_client(|request| {
            match request.get("method").and_then(|m| m.as_str()) {
                Some("tools/list") => Some(json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": { "tools": [
                        { "name": "alpha", "inputSchema": { "type": "object" } },
                        { "name": "beta", "inputSchema": { "type": "object" } }
                    ] }
                })),
                _ => None,
            }
        })
        .await;

        let first = client.list_tools().await.unwrap();
        let second = client.list_tools().await.unwrap();
        let names = |tools: &[McpTool]| -> Vec<String> {
            tools.iter().map(|t| t.name.clone()).collect()
        };
        assert_eq!(names(&first), vec!["alpha", "beta"]);
        assert_eq!(names(&first), names(&second));
    }

    #[tokio::test]
    async fn test_cancelling_one_invocation_leaves_the_connection_usable() {
        // "steady" is answered; "doomed" never is
        let (client, _sent, _inject) = ready_client(|request| {
            match request.get("method").and_then(|m| m.as_str()) {
                Some("tools/call") if request["params"]["name"] == "steady" => {
                    Some(tool_call_reply(request, "steady result"))
                }
                _ => None,
            }
        })
        .await;
        let client = Arc::new(client);

        let doomed_cancel = CancellationToken::new();
        let doomed = {
            let client = client.clone();
            let cancel = doomed_cancel.clone();
            tokio::spawn(async move {
                client
                    .invoke("doomed", json!({}), Duration::from_secs(5), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A second caller with its own token is not disturbed
        let other_cancel = CancellationToken::new();
        let steady = client
            .invoke("steady", json!({}), Duration::from_secs(1), &other_cancel)
            .await
            .unwrap();
        assert_eq!(steady.text(), "steady result");

        doomed_cancel.cancel();
        let err = doomed.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(client.state(), ConnectionState::Ready);
    }
}
