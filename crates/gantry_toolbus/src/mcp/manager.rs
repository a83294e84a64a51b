//! MCP server registry and lifecycle management.
//!
//! [`McpServerManager`] owns the server configurations and the live clients.
//! Servers are started explicitly (or all enabled ones via
//! [`start_enabled`](McpServerManager::start_enabled)); a server that dies is
//! not restarted automatically.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ConfigProvider;
use crate::mcp::client::McpClient;
use crate::mcp::config::McpServerConfig;
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::transport::{McpConnector, StdioConnector};

/// Result of [`McpServerManager::test_server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTestResult {
    pub success: bool,
    pub server_name: Option<String>,
    pub server_version: Option<String>,
    pub tool_count: usize,
    pub error: Option<String>,
}

impl ServerTestResult {
    fn failed(error: &McpError) -> Self {
        Self {
            success: false,
            server_name: None,
            server_version: None,
            tool_count: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Manager for a set of MCP servers.
///
/// # Example
///
/// ```ignore
/// use gantry_toolbus::{McpServerConfig, McpServerManager};
///
/// let manager = McpServerManager::new(vec![
///     McpServerConfig::new("fs", "mcp-server-filesystem").with_args(["."]),
/// ]);
/// manager.start_server("fs").await?;
/// println!("running: {:?}", manager.list_running().await);
/// manager.stop_all().await;
/// # Ok::<(), gantry_toolbus::mcp::McpError>(())
/// ```
pub struct McpServerManager {
    configs: RwLock<HashMap<String, McpServerConfig>>,
    running: RwLock<HashMap<String, Arc<McpClient>>>,
    connector: Arc<dyn McpConnector>,
    provider: Option<Arc<dyn ConfigProvider>>,
    // Per server: start and stop of one name never interleave, other names
    // are not held up.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl McpServerManager {
    pub fn new(configs: impl IntoIterator<Item = McpServerConfig>) -> Self {
        let mut by_name = HashMap::new();
        for config in configs {
            if by_name.contains_key(&config.name) {
                warn!("Duplicate MCP server '{}', keeping the last definition", config.name);
            }
            by_name.insert(config.name.clone(), config);
        }
        Self {
            configs: RwLock::new(by_name),
            running: RwLock::new(HashMap::new()),
            connector: Arc::new(StdioConnector),
            provider: None,
            locks: DashMap::new(),
        }
    }

    /// Servers from the provider; enable/disable toggles are written back to it.
    pub fn from_config(provider: Arc<dyn ConfigProvider>) -> Self {
        let servers = provider.mcp_servers();
        info!("Loaded {} MCP server configurations", servers.len());
        Self {
            provider: Some(provider),
            ..Self::new(servers)
        }
    }

    /// Replace how clients reach their servers (default: spawn the command).
    pub fn with_connector(mut self, connector: Arc<dyn McpConnector>) -> Self {
        self.connector = connector;
        self
    }

    fn server_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(name.to_string()).or_default().value())
    }

    /// Start `name` and perform the handshake.
    ///
    /// Starting a server that is already running is a no-op. A failed start
    /// leaves the server out of the running set.
    pub async fn start_server(&self, name: &str) -> McpResult<()> {
        let lock = self.server_lock(name);
        let _guard = lock.lock().await;

        let config = self
            .get_config(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        if !config.enabled {
            return Err(McpError::ServerDisabled(name.to_string()));
        }

        {
            let running = self.running.read().await;
            if let Some(client) = running.get(name) {
                if client.is_running() {
                    warn!("MCP server already running: {}", name);
                    return Ok(());
                }
            }
        }

        info!("Starting MCP server: {} ({})", name, config.command);
        let client = Arc::new(McpClient::with_connector(config, Arc::clone(&self.connector)));
        match client.start().await {
            Ok(()) => {
                // Replaces a client whose server died.
                let dead = self.running.write().await.insert(name.to_string(), client);
                if let Some(dead) = dead {
                    dead.stop().await;
                }
                info!("MCP server started: {}", name);
                Ok(())
            }
            Err(e) => {
                let dead = self.running.write().await.remove(name);
                if let Some(dead) = dead {
                    dead.stop().await;
                }
                error!("Failed to start MCP server '{}': {}", name, e);
                Err(e)
            }
        }
    }

    pub async fn stop_server(&self, name: &str) -> McpResult<()> {
        let lock = self.server_lock(name);
        let _guard = lock.lock().await;
        self.stop_locked(name).await
    }

    async fn stop_locked(&self, name: &str) -> McpResult<()> {
        let client = self
            .running
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ServerNotRunning(name.to_string()))?;

        info!("Stopping MCP server: {}", name);
        client.stop().await;
        Ok(())
    }

    /// Stop every running server concurrently.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.running.read().await.keys().cloned().collect();
        if names.is_empty() {
            return;
        }
        info!("Stopping {} MCP servers", names.len());
        join_all(names.iter().map(|name| async move {
            let lock = self.server_lock(name);
            let _guard = lock.lock().await;
            // Already gone when a concurrent stop won the race.
            let _ = self.stop_locked(name).await;
        }))
        .await;
    }

    /// Start every enabled server. Failures are logged and skipped; returns
    /// the names that are running afterwards.
    pub async fn start_enabled(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .await
            .values()
            .filter(|config| config.enabled)
            .map(|config| config.name.clone())
            .collect();
        names.sort();

        let mut started = Vec::new();
        for name in names {
            if self.start_server(&name).await.is_ok() {
                started.push(name);
            }
        }
        started
    }

    pub async fn enable_server(&self, name: &str) -> McpResult<()> {
        self.set_enabled(name, true).await
    }

    /// Disable `name`, stopping it first when it is running.
    pub async fn disable_server(&self, name: &str) -> McpResult<()> {
        let lock = self.server_lock(name);
        let _guard = lock.lock().await;
        if !self.configs.read().await.contains_key(name) {
            return Err(McpError::ServerNotFound(name.to_string()));
        }
        match self.stop_locked(name).await {
            Ok(()) | Err(McpError::ServerNotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> McpResult<()> {
        {
            let mut configs = self.configs.write().await;
            let config = configs
                .get_mut(name)
                .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
            if config.enabled == enabled {
                return Ok(());
            }
            config.enabled = enabled;
        }
        info!("MCP server '{}' {}", name, if enabled { "enabled" } else { "disabled" });

        if let Some(provider) = &self.provider {
            if let Err(e) = provider.set_server_enabled(name, enabled) {
                warn!("Failed to persist enabled={} for MCP server '{}': {}", enabled, name, e);
            }
        }
        Ok(())
    }

    pub async fn add_server(&self, config: McpServerConfig) -> McpResult<()> {
        let mut configs = self.configs.write().await;
        if configs.contains_key(&config.name) {
            return Err(McpError::Config(format!(
                "Server with name '{}' already exists",
                config.name
            )));
        }
        info!("Adding MCP server: {}", config.name);
        configs.insert(config.name.clone(), config);
        Ok(())
    }

    /// Forget `name`. A running server must be stopped first.
    pub async fn remove_server(&self, name: &str) -> McpResult<()> {
        let lock = self.server_lock(name);
        let _guard = lock.lock().await;
        if self.is_running(name).await {
            return Err(McpError::ServerAlreadyRunning(name.to_string()));
        }
        self.configs
            .write()
            .await
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        // Drop a dead client left behind by a crashed server.
        self.running.write().await.remove(name);
        info!("Removed MCP server: {}", name);
        Ok(())
    }

    /// The live client for `name`; `None` when stopped or dead.
    pub async fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.running
            .read()
            .await
            .get(name)
            .filter(|client| client.is_running())
            .cloned()
    }

    /// Live clients, sorted by server name.
    pub async fn running_clients(&self) -> Vec<Arc<McpClient>> {
        let mut clients: Vec<Arc<McpClient>> = self
            .running
            .read()
            .await
            .values()
            .filter(|client| client.is_running())
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.name().cmp(b.name()));
        clients
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.get_client(name).await.is_some()
    }

    pub async fn list_servers(&self) -> Vec<McpServerConfig> {
        let mut servers: Vec<McpServerConfig> = self.configs.read().await.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub async fn list_running(&self) -> Vec<String> {
        self.running_clients()
            .await
            .iter()
            .map(|client| client.name().to_string())
            .collect()
    }

    pub async fn get_config(&self, name: &str) -> Option<McpServerConfig> {
        self.configs.read().await.get(name).cloned()
    }

    /// Start a throwaway client, list its tools and stop it again.
    ///
    /// Connection problems are reported in the result; only an unknown
    /// server is an `Err`. Does not touch the running set.
    pub async fn test_server(&self, name: &str) -> McpResult<ServerTestResult> {
        let config = self
            .get_config(name)
            .await
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        info!("Testing MCP server: {}", name);
        let client = McpClient::with_connector(config, Arc::clone(&self.connector));
        if let Err(e) = client.start().await {
            return Ok(ServerTestResult::failed(&e));
        }

        let info = client.server_info();
        let tools = client.list_tools().await;
        client.stop().await;

        let mut result = match tools {
            Ok(tools) => ServerTestResult {
                success: true,
                server_name: None,
                server_version: None,
                tool_count: tools.len(),
                error: None,
            },
            Err(e) => ServerTestResult::failed(&e),
        };
        if let Some(info) = info {
            result.server_name = Some(info.name);
            result.server_version = Some(info.version);
        }
        debug!("MCP server test for '{}': {:?}", name, result);
        Ok(result)
    }
}

impl std::fmt::Debug for McpServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServerManager")
            .field("persistent", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}
