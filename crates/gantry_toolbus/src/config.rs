//! Configuration surface consumed by the core.
//!
//! Gantry never reads configuration files. A host application implements
//! [`ConfigProvider`] over whatever storage it uses (TOML, JSON, a settings
//! service) and hands it to [`PermissionManager::from_config`] and
//! [`McpServerManager::from_config`]. [`StaticConfig`] is an in-memory
//! implementation for embedding and tests.
//!
//! [`PermissionManager::from_config`]: crate::PermissionManager::from_config
//! [`McpServerManager::from_config`]: crate::McpServerManager::from_config

use std::collections::BTreeSet;
use std::sync::RwLock;

use thiserror::Error;

use crate::mcp::McpServerConfig;
use crate::permission::PermissionMode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to persist configuration: {0}")]
    Persist(String),

    #[error("Unknown MCP server: {0}")]
    UnknownServer(String),
}

/// Accessors for the settings the core depends on.
///
/// The write hooks default to no-ops so read-only providers only implement
/// the getters.
pub trait ConfigProvider: Send + Sync {
    fn mcp_servers(&self) -> Vec<McpServerConfig>;

    fn permission_mode(&self) -> PermissionMode;

    fn trusted_tools(&self) -> Vec<String>;

    /// Persist the full trusted-tool list after it changed.
    fn save_trusted_tools(&self, _tools: &[String]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Persist an enable/disable toggle for a server.
    fn set_server_enabled(&self, _name: &str, _enabled: bool) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// In-memory [`ConfigProvider`]. Writes are kept so callers can observe what
/// the core asked to persist.
#[derive(Debug, Default)]
pub struct StaticConfig {
    servers: RwLock<Vec<McpServerConfig>>,
    mode: PermissionMode,
    trusted: RwLock<BTreeSet<String>>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, server: McpServerConfig) -> Self {
        write_lock(&self.servers).push(server);
        self
    }

    pub fn with_mode(mut self, mode: PermissionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_trusted_tool(self, name: impl Into<String>) -> Self {
        write_lock(&self.trusted).insert(name.into());
        self
    }
}

impl ConfigProvider for StaticConfig {
    fn mcp_servers(&self) -> Vec<McpServerConfig> {
        read_lock(&self.servers).clone()
    }

    fn permission_mode(&self) -> PermissionMode {
        self.mode
    }

    fn trusted_tools(&self) -> Vec<String> {
        read_lock(&self.trusted).iter().cloned().collect()
    }

    fn save_trusted_tools(&self, tools: &[String]) -> Result<(), ConfigError> {
        *write_lock(&self.trusted) = tools.iter().cloned().collect();
        Ok(())
    }

    fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<(), ConfigError> {
        let mut servers = write_lock(&self.servers);
        let server = servers
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| ConfigError::UnknownServer(name.to_string()))?;
        server.enabled = enabled;
        Ok(())
    }
}

// A panic while holding one of these locks leaves plain data behind; keep using it.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
