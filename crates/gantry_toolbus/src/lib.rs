pub mod config;
pub mod executor;
pub mod mcp;
pub mod permission;
pub mod tools;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub use config::{ConfigError, ConfigProvider, StaticConfig};
pub use executor::{ExecutorConfig, ToolExecution, ToolExecutor};
pub use mcp::{McpClient, McpServerConfig, McpServerManager, McpToolAdapter, McpToolInfo, McpToolRegistry};
pub use permission::{PermissionDecision, PermissionManager, PermissionMode};
pub use tools::{Tool, ToolContext, ToolError, ToolResult};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool name must not be empty")]
    InvalidName,
}

/// A registered tool, tagged by where its implementation lives.
///
/// Resolved once at registration; both variants satisfy the same [`Tool`]
/// contract so callers never need to tell them apart.
#[derive(Clone)]
pub enum RegisteredTool {
    Local(Arc<dyn Tool>),
    Mcp(Arc<McpToolAdapter>),
}

impl RegisteredTool {
    pub fn tool(&self) -> Arc<dyn Tool> {
        match self {
            Self::Local(tool) => Arc::clone(tool),
            Self::Mcp(adapter) => Arc::clone(adapter) as Arc<dyn Tool>,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Local(tool) => tool.name(),
            Self::Mcp(adapter) => adapter.name(),
        }
    }

    pub fn is_mcp(&self) -> bool {
        matches!(self, Self::Mcp(_))
    }

    /// Owning MCP server, for MCP-backed tools.
    pub fn server_name(&self) -> Option<&str> {
        match self {
            Self::Local(_) => None,
            Self::Mcp(adapter) => Some(adapter.server_name()),
        }
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            Self::Mcp(adapter) => f.debug_tuple("Mcp").field(&adapter.name()).finish(),
        }
    }
}

/// Name → tool map shared by the agent loop and the executor.
///
/// Reads are concurrent; registration and removal take a per-shard write lock.
/// Construct one at startup and pass it around by `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a local tool. Last registration wins.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        self.insert(RegisteredTool::Local(tool))
    }

    pub fn register<T: Tool + 'static>(&self, tool: T) -> Result<(), RegistryError> {
        self.register_tool(Arc::new(tool))
    }

    pub fn register_mcp_tool(&self, adapter: Arc<McpToolAdapter>) -> Result<(), RegistryError> {
        self.insert(RegisteredTool::Mcp(adapter))
    }

    fn insert(&self, entry: RegisteredTool) -> Result<(), RegistryError> {
        let name = entry.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName);
        }
        if self.tools.insert(name.clone(), entry).is_some() {
            debug!("Replaced tool registration: {}", name);
        }
        Ok(())
    }

    /// Look up a tool by name; `None` when unknown.
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.tool())
    }

    pub fn get_entry(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.remove(name).map(|(_, entry)| entry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Enabled tools, sorted by name.
    pub fn get_enabled_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tools
            .iter()
            .map(|entry| entry.tool())
            .filter(|tool| tool.is_enabled())
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Descriptors of the enabled tools, for the model's tool list.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.get_enabled_tools()
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Run MCP discovery and publish every remote tool as an adapter.
    ///
    /// Adapters from a previous load are dropped first, so tools of servers
    /// that stopped disappear. Returns the number of adapters registered.
    pub async fn load_mcp_tools(&self, mcp: &McpToolRegistry) -> usize {
        mcp.discover_tools().await;

        self.tools.retain(|_, entry| !entry.is_mcp());

        let mut registered = 0;
        for adapter in mcp.adapters().await {
            let name = adapter.name().to_string();
            match self.register_mcp_tool(Arc::new(adapter)) {
                Ok(()) => registered += 1,
                Err(e) => debug!("Skipping MCP tool '{}': {}", name, e),
            }
        }

        info!("Registered {} MCP tools", registered);
        registered
    }
}

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}
