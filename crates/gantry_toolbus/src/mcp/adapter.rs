use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::mcp::error::McpError;
use crate::mcp::manager::McpServerManager;
use crate::mcp::registry::McpToolInfo;
use crate::tools::{Tool, ToolContext};

/// Exposes a remote MCP tool through the local [`Tool`] contract.
///
/// The server is resolved on every call, so an adapter outlives restarts of
/// its server and fails cleanly while the server is down.
#[derive(Clone)]
pub struct McpToolAdapter {
    id: String,
    info: McpToolInfo,
    manager: Arc<McpServerManager>,
}

impl McpToolAdapter {
    pub fn new(info: McpToolInfo, manager: Arc<McpServerManager>) -> Self {
        Self {
            id: info.id(),
            info,
            manager,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.info.server_name
    }

    pub fn remote_name(&self) -> &str {
        self.info.remote_name()
    }

    pub fn info(&self) -> &McpToolInfo {
        &self.info
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        self.info.tool.description()
    }

    fn parameters_schema(&self) -> JsonValue {
        self.info.tool.parameters_schema()
    }

    fn is_read_only(&self) -> bool {
        self.info.tool.is_read_only()
    }

    async fn call(&self, args: JsonValue, _ctx: &ToolContext) -> anyhow::Result<JsonValue> {
        let client = self
            .manager
            .get_client(self.server_name())
            .await
            .ok_or_else(|| McpError::ServerNotRunning(self.server_name().to_string()))?;

        let result = client.call_tool(self.remote_name(), args).await?;

        if result.is_error {
            match result.joined_text() {
                Some(text) if !text.is_empty() => bail!(text),
                _ => bail!("remote tool '{}' reported an error", self.id),
            }
        }

        match result.joined_text() {
            Some(text) => Ok(JsonValue::String(text)),
            None => serde_json::to_value(&result.content)
                .map_err(|e| anyhow!("unserializable tool content: {}", e)),
        }
    }
}

impl std::fmt::Debug for McpToolAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolAdapter")
            .field("id", &self.id)
            .field("server", &self.info.server_name)
            .finish()
    }
}
