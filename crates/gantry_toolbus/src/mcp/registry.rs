use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::mcp::adapter::McpToolAdapter;
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::manager::McpServerManager;
use crate::mcp::protocol::{CallToolResult, McpTool};

/// Separator between server name and tool name in a tool id.
pub const TOOL_ID_SEPARATOR: char = '.';

/// A remote tool together with the server that hosts it.
#[derive(Debug, Clone, PartialEq)]
pub struct McpToolInfo {
    pub server_name: String,
    pub tool: McpTool,
}

impl McpToolInfo {
    pub fn new(server_name: impl Into<String>, tool: McpTool) -> Self {
        Self {
            server_name: server_name.into(),
            tool,
        }
    }

    /// Registry-wide identity, `server.tool`.
    pub fn id(&self) -> String {
        format!("{}{}{}", self.server_name, TOOL_ID_SEPARATOR, self.tool.name)
    }

    /// Name the server knows the tool by.
    pub fn remote_name(&self) -> &str {
        &self.tool.name
    }
}

/// Catalogue of the tools offered by all running MCP servers.
pub struct McpToolRegistry {
    manager: Arc<McpServerManager>,
    tools: RwLock<HashMap<String, McpToolInfo>>,
}

impl McpToolRegistry {
    pub fn new(manager: Arc<McpServerManager>) -> Self {
        Self {
            manager,
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<McpServerManager> {
        &self.manager
    }

    /// Ask every running server for its tools and replace the catalogue.
    ///
    /// A server that fails to answer is logged and contributes nothing;
    /// the others are unaffected. Returns the number of tools found.
    pub async fn discover_tools(&self) -> usize {
        let clients = self.manager.running_clients().await;
        let listings = join_all(clients.iter().map(|client| async move {
            (client.name().to_string(), client.list_tools().await)
        }))
        .await;

        let mut discovered = HashMap::new();
        for (server, listing) in listings {
            match listing {
                Ok(tools) => {
                    debug!("[MCP:{}] Discovered {} tools", server, tools.len());
                    for tool in tools {
                        let info = McpToolInfo::new(server.clone(), tool);
                        discovered.insert(info.id(), info);
                    }
                }
                Err(e) => warn!("[MCP:{}] Tool discovery failed: {}", server, e),
            }
        }

        let count = discovered.len();
        *self.tools.write().await = discovered;
        info!("Discovered {} MCP tools from {} servers", count, clients.len());
        count
    }

    pub async fn get(&self, id: &str) -> Option<McpToolInfo> {
        self.tools.read().await.get(id).cloned()
    }

    /// All known tools, sorted by id.
    pub async fn tools(&self) -> Vec<McpToolInfo> {
        let mut tools: Vec<McpToolInfo> = self.tools.read().await.values().cloned().collect();
        tools.sort_by_key(|info| info.id());
        tools
    }

    pub async fn tools_for_server(&self, server_name: &str) -> Vec<McpToolInfo> {
        let mut tools: Vec<McpToolInfo> = self
            .tools
            .read()
            .await
            .values()
            .filter(|info| info.server_name == server_name)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.tool.name.cmp(&b.tool.name));
        tools
    }

    pub async fn len(&self) -> usize {
        self.tools.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// Invoke the tool `id` on the server that owns it.
    pub async fn call_tool(&self, id: &str, arguments: JsonValue) -> McpResult<CallToolResult> {
        let info = self
            .get(id)
            .await
            .ok_or_else(|| McpError::ToolNotFound(id.to_string()))?;
        let client = self
            .manager
            .get_client(&info.server_name)
            .await
            .ok_or_else(|| McpError::ServerNotRunning(info.server_name.clone()))?;
        client.call_tool(info.remote_name(), arguments).await
    }

    /// One [`Tool`](crate::Tool) adapter per known tool, sorted by id.
    pub async fn adapters(&self) -> Vec<McpToolAdapter> {
        self.tools()
            .await
            .into_iter()
            .map(|info| McpToolAdapter::new(info, Arc::clone(&self.manager)))
            .collect()
    }
}

impl std::fmt::Debug for McpToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolRegistry").finish_non_exhaustive()
    }
}
