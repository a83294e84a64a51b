//! Permission policy for tool calls.
//!
//! A decision depends only on the session's [`PermissionMode`], the tool's
//! `needs_permissions` / `is_read_only` flags and whether the tool name is in
//! the trusted set:
//!
//! | mode                | outcome                                              |
//! |---------------------|------------------------------------------------------|
//! | `BypassPermissions` | always allowed                                       |
//! | `Plan`              | allowed iff read-only, otherwise denied              |
//! | `AcceptEdits`       | always allowed (edits auto-approved)                 |
//! | `Default`           | allowed if no permission needed or trusted, else ask |
//!
//! `NeedsApproval` is not executable. An approval flow must call
//! [`PermissionManager::add_trusted_tool`] and retry the call itself.

use std::fmt;
use std::sync::{Arc, RwLock};

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{read_lock, write_lock, ConfigProvider};
use crate::tools::Tool;

/// Session-wide policy for whether tool calls need confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Ask before tools that need permission, unless trusted
    #[default]
    Default,
    /// Auto-approve edits
    AcceptEdits,
    /// Read-only tools only
    Plan,
    /// Skip every check
    BypassPermissions,
}

impl PermissionMode {
    pub const ALL: [PermissionMode; 4] = [
        Self::Default,
        Self::AcceptEdits,
        Self::Plan,
        Self::BypassPermissions,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Self::Default),
            "acceptEdits" => Some(Self::AcceptEdits),
            "plan" => Some(Self::Plan),
            "bypassPermissions" => Some(Self::BypassPermissions),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    NeedsApproval(String),
    Denied(String),
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Holds the permission mode and trusted-tool set for one session.
pub struct PermissionManager {
    mode: RwLock<PermissionMode>,
    trusted: DashSet<String>,
    config: Option<Arc<dyn ConfigProvider>>,
}

impl PermissionManager {
    pub fn new(mode: PermissionMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            trusted: DashSet::new(),
            config: None,
        }
    }

    /// Seed mode and trusted tools from the configuration collaborator and
    /// write trust changes back through it.
    pub fn from_config(config: Arc<dyn ConfigProvider>) -> Self {
        let manager = Self::new(config.permission_mode());
        for name in config.trusted_tools() {
            manager.trusted.insert(name);
        }
        Self {
            config: Some(config),
            ..manager
        }
    }

    pub fn mode(&self) -> PermissionMode {
        *read_lock(&self.mode)
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        let previous = std::mem::replace(&mut *write_lock(&self.mode), mode);
        if previous != mode {
            info!("Permission mode changed: {} -> {}", previous, mode);
        }
    }

    pub fn check(&self, tool: &dyn Tool) -> PermissionDecision {
        let decision = decide(
            self.mode(),
            tool.needs_permissions(),
            tool.is_read_only(),
            self.is_trusted(tool.name()),
        );
        debug!("Permission for '{}' in {} mode: {:?}", tool.name(), self.mode(), decision);
        decision
    }

    pub fn is_trusted(&self, name: &str) -> bool {
        self.trusted.contains(name)
    }

    /// Sorted snapshot of the trusted set.
    pub fn trusted_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.trusted.iter().map(|name| name.clone()).collect();
        names.sort();
        names
    }

    /// Exempt `name` from confirmation in Default mode. Returns `false` when it
    /// was already trusted.
    pub fn add_trusted_tool(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        let added = self.trusted.insert(name.clone());
        if added {
            info!("Trusted tool added: {}", name);
            self.persist();
        }
        added
    }

    pub fn remove_trusted_tool(&self, name: &str) -> bool {
        let removed = self.trusted.remove(name).is_some();
        if removed {
            info!("Trusted tool removed: {}", name);
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        if let Some(config) = &self.config {
            if let Err(e) = config.save_trusted_tools(&self.trusted_tools()) {
                warn!("Failed to persist trusted tools: {}", e);
            }
        }
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new(PermissionMode::Default)
    }
}

impl fmt::Debug for PermissionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionManager")
            .field("mode", &self.mode())
            .field("trusted", &self.trusted_tools())
            .field("persistent", &self.config.is_some())
            .finish()
    }
}

fn decide(
    mode: PermissionMode,
    needs_permissions: bool,
    read_only: bool,
    trusted: bool,
) -> PermissionDecision {
    match mode {
        PermissionMode::BypassPermissions => PermissionDecision::Allowed,
        PermissionMode::Plan if read_only => PermissionDecision::Allowed,
        PermissionMode::Plan => {
            PermissionDecision::Denied("plan mode only allows read-only tools".to_string())
        }
        PermissionMode::AcceptEdits => PermissionDecision::Allowed,
        PermissionMode::Default if !needs_permissions || trusted => PermissionDecision::Allowed,
        PermissionMode::Default => {
            PermissionDecision::NeedsApproval("tool requires user approval".to_string())
        }
    }
}
