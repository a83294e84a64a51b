use thiserror::Error;

/// MCP-related errors
#[derive(Error, Debug)]
pub enum McpError {
    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server already running: {0}")]
    ServerAlreadyRunning(String),

    #[error("MCP server not running: {0}")]
    ServerNotRunning(String),

    #[error("MCP server is disabled: {0}")]
    ServerDisabled(String),

    /// `start()` on a client that is already connected.
    #[error("MCP client already running: {0}")]
    AlreadyRunning(String),

    #[error("Failed to start MCP server: {0}")]
    StartFailed(String),

    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client was stopped while the request was outstanding.
    #[error("MCP client stopped")]
    Stopped,

    /// The server closed its output stream.
    #[error("MCP server disconnected: {0}")]
    Disconnected(String),

    #[error("MCP request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
