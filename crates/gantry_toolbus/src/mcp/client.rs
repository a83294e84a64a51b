//! MCP client: one child process, JSON-RPC over its stdin/stdout.
//!
//! Requests are correlated by a per-client integer id. A background reader
//! task owns the server's stdout and completes the matching pending sender,
//! so any number of requests may be in flight at once and may be answered
//! in any order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use gantry_observability::{mcp_span, record_duration};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::{read_lock, write_lock};
use crate::mcp::config::McpServerConfig;
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::protocol::{
    error_codes, CallToolRequest, CallToolResult, Implementation, IncomingMessage,
    InitializeParams, InitializeResult, JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListToolsParams, ListToolsResult, McpTool,
};
use crate::mcp::transport::{McpConnector, McpTransport, StdioConnector};

/// Guard against servers that keep handing out cursors.
const MAX_LIST_PAGES: usize = 64;

type Responder = oneshot::Sender<McpResult<JsonValue>>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncBufRead + Send + Unpin>;

/// State shared with the reader task.
struct Connection {
    server: String,
    pending: DashMap<u64, Responder>,
    running: AtomicBool,
    writer: Mutex<Option<Writer>>,
}

impl Connection {
    /// Write one message as a single line and flush it.
    async fn write_line<T: Serialize>(&self, message: &T) -> McpResult<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(McpError::Stopped)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    fn fail_pending(&self, error: impl Fn() -> McpError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(error()));
            }
        }
    }
}

pub struct McpClient {
    config: McpServerConfig,
    connector: Arc<dyn McpConnector>,
    conn: Arc<Connection>,
    next_id: AtomicU64,
    process: Mutex<Option<Child>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    server_info: RwLock<Option<Implementation>>,
    // Serializes start() and stop().
    lifecycle: Mutex<()>,
}

impl McpClient {
    /// A client that spawns `config.command` on [`start`](Self::start).
    pub fn new(config: McpServerConfig) -> Self {
        Self::with_connector(config, Arc::new(StdioConnector))
    }

    pub fn with_connector(config: McpServerConfig, connector: Arc<dyn McpConnector>) -> Self {
        let conn = Arc::new(Connection {
            server: config.name.clone(),
            pending: DashMap::new(),
            running: AtomicBool::new(false),
            writer: Mutex::new(None),
        });
        Self {
            config,
            connector,
            conn,
            next_id: AtomicU64::new(1),
            process: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            server_info: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.conn.running.load(Ordering::SeqCst)
    }

    /// Server name and version reported during the handshake.
    pub fn server_info(&self) -> Option<Implementation> {
        read_lock(&self.server_info).clone()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.conn.pending.len()
    }

    /// Connect and perform the `initialize` handshake.
    ///
    /// On any failure the connection is torn down again and the error
    /// returned; the client can be started again afterwards.
    pub async fn start(&self) -> McpResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(McpError::AlreadyRunning(self.config.name.clone()));
        }
        let transport = self.connector.connect(&self.config).await?;
        self.attach_and_initialize(transport).await
    }

    /// Like [`start`](Self::start) over already-connected streams.
    pub async fn start_with_transport(&self, transport: McpTransport) -> McpResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(McpError::AlreadyRunning(self.config.name.clone()));
        }
        self.attach_and_initialize(transport).await
    }

    async fn attach_and_initialize(&self, transport: McpTransport) -> McpResult<()> {
        self.attach(transport).await;
        match self.initialize().await {
            Ok(result) => {
                let server_info = result.server_info;
                match &server_info {
                    Some(server) => info!(
                        "[MCP:{}] Initialized: {} v{}",
                        self.config.name, server.name, server.version
                    ),
                    None => info!("[MCP:{}] Initialized", self.config.name),
                }
                *write_lock(&self.server_info) = server_info;
                Ok(())
            }
            Err(e) => {
                warn!("[MCP:{}] Handshake failed: {}", self.config.name, e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn attach(&self, transport: McpTransport) {
        let McpTransport { reader, writer, process } = transport;
        *self.conn.writer.lock().await = Some(writer);
        *self.process.lock().await = process;
        self.conn.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(read_loop(Arc::clone(&self.conn), reader));
        if let Some(previous) = lock_reader(&self.reader).replace(handle) {
            previous.abort();
        }
    }

    async fn initialize(&self) -> McpResult<InitializeResult> {
        let params = InitializeParams::new(Implementation::new("gantry", env!("CARGO_PKG_VERSION")));
        let result = self.request("initialize", Some(serde_json::to_value(params)?)).await?;
        let result: InitializeResult = decode("initialize", result)?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Fail pending requests, close the streams and terminate the process.
    ///
    /// The process gets `shutdown_grace` to exit after stdin closes before it
    /// is killed. Calling this on a stopped client is a no-op.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        let was_running = self.conn.running.swap(false, Ordering::SeqCst);
        self.conn.fail_pending(|| McpError::Stopped);

        if let Some(mut writer) = self.conn.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        if let Some(mut child) = self.process.lock().await.take() {
            let grace = self.config.shutdown_grace();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!("[MCP:{}] Exited: {}", self.config.name, status),
                Ok(Err(e)) => warn!("[MCP:{}] Wait failed: {}", self.config.name, e),
                Err(_) => {
                    warn!(
                        "[MCP:{}] No exit within {}ms, killing",
                        self.config.name,
                        grace.as_millis()
                    );
                    if let Err(e) = child.kill().await {
                        warn!("[MCP:{}] Kill failed: {}", self.config.name, e);
                    }
                }
            }
        }

        if let Some(handle) = lock_reader(&self.reader).take() {
            handle.abort();
        }

        if was_running {
            info!("[MCP:{}] Stopped", self.config.name);
        }
    }

    /// Send a request and wait for its response.
    ///
    /// Bounded by the server's `request_timeout`; fails with
    /// [`McpError::Stopped`] once the client is stopped.
    pub async fn request(&self, method: &str, params: Option<JsonValue>) -> McpResult<JsonValue> {
        if !self.is_running() {
            return Err(McpError::Stopped);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.conn.pending.insert(id, tx);
        // Removes the entry however this future ends, including being dropped.
        let _pending = PendingGuard { pending: &self.conn.pending, id };
        // stop() may have drained the map between the check above and the insert.
        if !self.is_running() {
            return Err(McpError::Stopped);
        }

        let span = mcp_span!(self.config.name.as_str(), method);
        async {
            let started = Instant::now();
            let request = JsonRpcRequest::new(id, method, params);
            self.conn.write_line(&request).await?;
            debug!("[MCP:{}] -> {} (id {})", self.config.name, method, id);

            let timeout = self.config.request_timeout();
            let outcome = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(McpError::Stopped),
                Err(_) => Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            record_duration("duration_ms", started.elapsed());
            outcome
        }
        .instrument(span)
        .await
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&self, method: &str, params: Option<JsonValue>) -> McpResult<()> {
        if !self.is_running() {
            return Err(McpError::Stopped);
        }
        self.conn.write_line(&JsonRpcNotification::new(method, params)).await
    }

    /// All tools the server advertises, following `nextCursor` pagination.
    pub async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .take()
                .map(|c| serde_json::to_value(ListToolsParams { cursor: Some(c) }))
                .transpose()?;
            let page: ListToolsResult = decode("tools/list", self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        if cursor.is_some() {
            warn!("[MCP:{}] tools/list still paginating after {} pages", self.config.name, MAX_LIST_PAGES);
        }

        debug!("[MCP:{}] Found {} tools", self.config.name, tools.len());
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: JsonValue) -> McpResult<CallToolResult> {
        let params = serde_json::to_value(CallToolRequest::new(name, arguments))?;
        let result: CallToolResult = decode("tools/call", self.request("tools/call", Some(params)).await?)?;
        if result.is_error {
            debug!("[MCP:{}] Tool '{}' reported an error", self.config.name, name);
        }
        Ok(result)
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(handle) = lock_reader(&self.reader).take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("name", &self.config.name)
            .field("running", &self.is_running())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

struct PendingGuard<'a> {
    pending: &'a DashMap<u64, Responder>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// A result that does not have the shape `method` promises is a protocol error.
fn decode<T: DeserializeOwned>(method: &str, value: JsonValue) -> McpResult<T> {
    serde_json::from_value(value).map_err(|e| McpError::Protocol(format!("invalid {} result: {}", method, e)))
}

fn lock_reader(
    reader: &std::sync::Mutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    reader.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_loop(conn: Arc<Connection>, mut reader: Reader) {
    // Raw bytes: a line that is not UTF-8 is just another unparsable line.
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                info!("[MCP:{}] Server closed its output", conn.server);
                break;
            }
            Ok(_) => {
                let trimmed = line.trim_ascii();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<JsonValue>(trimmed) {
                    Ok(value) => dispatch(&conn, value).await,
                    Err(e) => warn!(
                        "[MCP:{}] Unparsable line ({}): {}",
                        conn.server,
                        e,
                        String::from_utf8_lossy(trimmed)
                    ),
                }
            }
            Err(e) => {
                warn!("[MCP:{}] Read error: {}", conn.server, e);
                break;
            }
        }
    }

    conn.running.store(false, Ordering::SeqCst);
    conn.fail_pending(|| McpError::Disconnected(conn.server.clone()));
}

async fn dispatch(conn: &Connection, value: JsonValue) {
    match IncomingMessage::classify(value) {
        Some(IncomingMessage::Response { id, result }) => match conn.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(result.map_err(|e| McpError::JsonRpc {
                    code: e.code,
                    message: e.message,
                }));
            }
            None => warn!("[MCP:{}] Response for unknown id {}", conn.server, id),
        },
        Some(IncomingMessage::Request { id, method, .. }) => {
            let response = if method == "ping" {
                JsonRpcResponse::success(id, json!({}))
            } else {
                debug!("[MCP:{}] Rejecting server request '{}'", conn.server, method);
                JsonRpcResponse::error(
                    id,
                    JsonRpcErrorObject::new(error_codes::METHOD_NOT_FOUND, format!("Method not found: {}", method)),
                )
            };
            if let Err(e) = conn.write_line(&response).await {
                debug!("[MCP:{}] Failed to answer '{}': {}", conn.server, method, e);
            }
        }
        Some(IncomingMessage::Notification { method, .. }) => {
            debug!("[MCP:{}] Notification: {}", conn.server, method);
        }
        None => warn!("[MCP:{}] Ignoring non JSON-RPC message", conn.server),
    }
}
