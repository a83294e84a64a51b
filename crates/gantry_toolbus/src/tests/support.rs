//! Shared fixtures: scriptable tools and an in-process MCP server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

use crate::mcp::{McpConnector, McpError, McpServerConfig, McpTransport};
use crate::tools::{Tool, ToolContext};

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

// =============================================================================
// Mock tools
// =============================================================================

pub enum Behavior {
    Return(JsonValue),
    Fail(&'static str),
    Panic(&'static str),
    /// Never completes and ignores cancellation.
    Hang,
    Sleep(Duration),
    /// Completes once the call's cancellation token fires.
    WaitForCancel(Arc<AtomicBool>),
}

pub struct MockTool {
    name: String,
    read_only: bool,
    needs_permissions: Option<bool>,
    enabled: bool,
    behavior: Behavior,
    calls: Arc<AtomicUsize>,
}

impl MockTool {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            read_only: false,
            needs_permissions: None,
            enabled: true,
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn returning(name: &str, output: JsonValue) -> Self {
        Self::new(name, Behavior::Return(output))
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn needs_permissions(mut self, needs: bool) -> Self {
        self.needs_permissions = Some(needs);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn shared(self) -> Arc<dyn Tool> {
        Arc::new(self)
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn parameters_schema(&self) -> JsonValue {
        json!({"type": "object", "properties": {}})
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn needs_permissions(&self) -> bool {
        self.needs_permissions.unwrap_or(!self.read_only)
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn call(&self, args: JsonValue, ctx: &ToolContext) -> anyhow::Result<JsonValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Return(output) => Ok(output.clone()),
            Behavior::Fail(message) => Err(anyhow!(*message)),
            Behavior::Panic(message) => panic!("{}", message),
            Behavior::Hang => std::future::pending().await,
            Behavior::Sleep(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(args)
            }
            Behavior::WaitForCancel(observed) => {
                ctx.cancellation().cancelled().await;
                observed.store(true, Ordering::SeqCst);
                Ok(JsonValue::Null)
            }
        }
    }
}

// =============================================================================
// Fake MCP server
// =============================================================================

/// Scripted MCP server answering over an in-memory pipe.
///
/// `tools/call` dispatches on the tool name:
/// - `read_file`: text `contents of <path>`
/// - `fail`: `isError` result with text `disk on fire`
/// - `rpc_error`: JSON-RPC error -32000
/// - `image`: mixed text and image content
/// - `hang`: never answers
/// - `crash`: closes the connection
/// - `malformed`: a result whose `content` is not a list
/// - anything else: text `<name> <arguments>`, delayed by `arguments.delay_ms`
#[derive(Default)]
pub struct FakeServer {
    tools: Vec<JsonValue>,
    page_size: Option<usize>,
    initialize: InitializeReply,
    list: ListReply,
    chatty: bool,
    received: Mutex<Vec<JsonValue>>,
}

#[derive(Default, Clone, Copy, PartialEq)]
enum InitializeReply {
    #[default]
    Accept,
    Refuse,
    Silent,
}

#[derive(Default, Clone, Copy, PartialEq)]
enum ListReply {
    #[default]
    Pages,
    Error,
    /// `tools` is a number instead of a list.
    Malformed,
    /// A line of invalid UTF-8 goes out ahead of the real reply.
    GarbageFirst,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|name| tool_def(name, false)).collect(),
            ..Self::default()
        }
    }

    pub fn push_tool(mut self, tool: JsonValue) -> Self {
        self.tools.push(tool);
        self
    }

    /// Serve `tools/list` in pages of `size`, chained by cursor.
    pub fn paged(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn refusing_initialize(mut self) -> Self {
        self.initialize = InitializeReply::Refuse;
        self
    }

    /// Read `initialize` and never answer it.
    pub fn silent_initialize(mut self) -> Self {
        self.initialize = InitializeReply::Silent;
        self
    }

    pub fn failing_list(mut self) -> Self {
        self.list = ListReply::Error;
        self
    }

    pub fn malformed_list(mut self) -> Self {
        self.list = ListReply::Malformed;
        self
    }

    pub fn garbage_before_list(mut self) -> Self {
        self.list = ListReply::GarbageFirst;
        self
    }

    /// After the handshake, send noise: a ping, garbage and a stray response.
    pub fn chatty(mut self) -> Self {
        self.chatty = true;
        self
    }

    /// Every message the server has read, in order.
    pub fn received(&self) -> Vec<JsonValue> {
        self.received.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_string))
            .collect()
    }

    /// Params of every `tools/call` request.
    pub fn calls(&self) -> Vec<JsonValue> {
        self.received()
            .into_iter()
            .filter(|m| m["method"] == "tools/call")
            .map(|m| m["params"].clone())
            .collect()
    }
}

pub fn tool_def(name: &str, read_only: bool) -> JsonValue {
    json!({
        "name": name,
        "description": format!("{} tool", name),
        "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}},
        "annotations": {"readOnlyHint": read_only}
    })
}

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

/// Start `server` on a fresh pipe and return the client's end.
pub fn connect_fake(server: Arc<FakeServer>) -> McpTransport {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    tokio::spawn(serve(
        server,
        server_read,
        Arc::new(tokio::sync::Mutex::new(server_write)),
    ));
    let (client_read, client_write) = tokio::io::split(client_side);
    McpTransport::from_io(client_read, client_write)
}

async fn send_bytes(writer: &SharedWriter, line: &[u8]) {
    let mut writer = writer.lock().await;
    let _ = writer.write_all(line).await;
    let _ = writer.write_all(b"\n").await;
    let _ = writer.flush().await;
}

async fn send_raw(writer: &SharedWriter, line: &str) {
    send_bytes(writer, line.as_bytes()).await;
}

async fn send(writer: &SharedWriter, message: JsonValue) {
    send_raw(writer, &message.to_string()).await;
}

fn result(id: JsonValue, result: JsonValue) -> JsonValue {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: JsonValue, code: i32, message: &str) -> JsonValue {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn text_result(text: String) -> JsonValue {
    json!({"content": [{"type": "text", "text": text}]})
}

async fn serve(server: Arc<FakeServer>, read: ReadHalf<DuplexStream>, writer: SharedWriter) {
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<JsonValue>(&line) else {
            continue;
        };
        server.received.lock().unwrap().push(message.clone());

        let id = message["id"].clone();
        let params = message["params"].clone();
        match message["method"].as_str().unwrap_or_default() {
            "initialize" if server.initialize == InitializeReply::Refuse => {
                send(&writer, error(id, -32603, "initialize refused")).await;
            }
            "initialize" if server.initialize == InitializeReply::Silent => {}
            "initialize" => {
                let info = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "1.0.0"}
                });
                send(&writer, result(id, info)).await;
            }
            "notifications/initialized" if server.chatty => {
                send_raw(&writer, "this is not json").await;
                send_raw(&writer, "").await;
                send(&writer, json!({"jsonrpc": "2.0", "id": 9999, "result": {}})).await;
                send(&writer, json!({"jsonrpc": "2.0", "method": "notifications/message"})).await;
                send(&writer, json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"})).await;
                send(&writer, json!({"jsonrpc": "2.0", "id": "srv-2", "method": "sampling/createMessage"})).await;
            }
            "tools/list" if server.list == ListReply::Error => {
                send(&writer, error(id, -32603, "listing exploded")).await;
            }
            "tools/list" if server.list == ListReply::Malformed => {
                send(&writer, result(id, json!({"tools": 5}))).await;
            }
            "tools/list" => {
                if server.list == ListReply::GarbageFirst {
                    send_bytes(&writer, b"garbage \xff\xfe not utf8").await;
                }
                let start = params["cursor"]
                    .as_str()
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let size = server.page_size.unwrap_or(server.tools.len().max(1));
                let start = start.min(server.tools.len());
                let end = (start + size).min(server.tools.len());
                let mut page = json!({"tools": server.tools[start..end].to_vec()});
                if end < server.tools.len() {
                    page["nextCursor"] = json!(end.to_string());
                }
                send(&writer, result(id, page)).await;
            }
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let args = params["arguments"].clone();
                match name.as_str() {
                    "crash" => return,
                    "hang" => {}
                    "fail" => {
                        let failed = json!({
                            "content": [{"type": "text", "text": "disk on fire"}],
                            "isError": true
                        });
                        send(&writer, result(id, failed)).await;
                    }
                    "malformed" => send(&writer, result(id, json!({"content": 7}))).await,
                    "rpc_error" => send(&writer, error(id, -32000, "backend unavailable")).await,
                    "image" => {
                        let mixed = json!({"content": [
                            {"type": "text", "text": "chart"},
                            {"type": "image", "data": "AAAA", "mimeType": "image/png"}
                        ]});
                        send(&writer, result(id, mixed)).await;
                    }
                    "read_file" => {
                        let path = args["path"].as_str().unwrap_or("?");
                        send(&writer, result(id, text_result(format!("contents of {}", path)))).await;
                    }
                    other => {
                        let text = format!("{} {}", other, args);
                        let delay = Duration::from_millis(args["delay_ms"].as_u64().unwrap_or(0));
                        let writer = Arc::clone(&writer);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            send(&writer, result(id, text_result(text))).await;
                        });
                    }
                }
            }
            // Our replies to server requests carry no method.
            "" => {}
            _ if !id.is_null() => send(&writer, error(id, -32601, "Method not found")).await,
            _ => {}
        }
    }
}

/// Connector handing out [`FakeServer`]s by server name. Unknown names fail
/// to start, like a missing binary.
#[derive(Default)]
pub struct FakeConnector {
    servers: Mutex<HashMap<String, Arc<FakeServer>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, name: &str, server: FakeServer) -> Self {
        self.servers.lock().unwrap().insert(name.to_string(), Arc::new(server));
        self
    }

    pub fn server(&self, name: &str) -> Arc<FakeServer> {
        Arc::clone(&self.servers.lock().unwrap()[name])
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpConnector for FakeConnector {
    async fn connect(&self, config: &McpServerConfig) -> Result<McpTransport, McpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let server = self.servers.lock().unwrap().get(&config.name).cloned();
        match server {
            Some(server) => Ok(connect_fake(server)),
            None => Err(McpError::StartFailed(format!("{}: no such server", config.name))),
        }
    }
}
