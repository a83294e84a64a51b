use std::fmt;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Longest output excerpt shown by the default result renderer.
const RENDER_PREVIEW_CHARS: usize = 200;

/// Outcome of one tool invocation as seen by the agent loop.
///
/// Immutable once constructed; the executor never hands back anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(JsonValue),
    Error(ToolError),
}

impl ToolResult {
    pub fn success(output: impl Into<JsonValue>) -> Self {
        Self::Success(output.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn output(&self) -> Option<&JsonValue> {
        match self {
            Self::Success(output) => Some(output),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolError> {
        match self {
            Self::Success(_) => None,
            Self::Error(err) => Some(err),
        }
    }

    /// JSON form handed back to the model.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Success(output) => serde_json::json!({ "output": output, "is_error": false }),
            Self::Error(err) => serde_json::json!({
                "error": err.to_string(),
                "kind": err.kind(),
                "is_error": true
            }),
        }
    }
}

impl fmt::Display for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(JsonValue::String(text)) => f.write_str(text),
            Self::Success(output) => write!(f, "{}", output),
            Self::Error(err) => write!(f, "{}", err),
        }
    }
}

/// Why a tool call produced no output.
///
/// Each variant renders a distinct message so the UI can tell a denial from a
/// timeout from a failing tool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Permission denied for '{tool}': {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("Approval required for '{tool}': {reason}")]
    ApprovalRequired { tool: String, reason: String },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("Tool '{tool}' was cancelled")]
    Cancelled { tool: String },

    #[error("Tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool not found: {0}")]
    NotFound(String),
}

impl ToolError {
    /// Stable machine-readable tag for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Per-call context passed to [`Tool::call`].
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Token tripped when the call times out or is cancelled. Long-running
    /// tools should select on [`CancellationToken::cancelled`] to stop early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A named capability the agent can invoke with JSON arguments.
///
/// `call` is the only side-effecting operation and knows nothing about
/// permissions; gating happens in [`ToolExecutor`](crate::ToolExecutor).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> JsonValue;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Whether two calls may safely run at the same time.
    fn is_concurrency_safe(&self) -> bool {
        self.is_read_only()
    }

    fn needs_permissions(&self) -> bool {
        !self.is_read_only()
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn call(&self, args: JsonValue, ctx: &ToolContext) -> anyhow::Result<JsonValue>;

    /// One-line summary of a pending call, e.g. `read_file(path: "a.txt")`.
    fn render_tool_use_message(&self, args: &JsonValue) -> String {
        format!("{}({})", self.name(), render_args(args))
    }

    fn render_tool_result_message(&self, result: &ToolResult) -> String {
        match result {
            ToolResult::Success(_) => truncate(&result.to_string(), RENDER_PREVIEW_CHARS),
            ToolResult::Error(err) => format!("Error: {}", err),
        }
    }
}

fn render_args(args: &JsonValue) -> String {
    match args {
        JsonValue::Object(map) => map
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value))
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
