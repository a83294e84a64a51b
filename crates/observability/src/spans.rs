//! Span helpers shared by the tool executor and the MCP layer

/// Create a span around a single tool invocation.
///
/// Declares an empty `duration_ms` field so [`record_duration`](crate::record_duration)
/// can fill it once the call settles, plus `error` / `error.message` for
/// [`record_error`](crate::record_error).
///
/// ```rust
/// use gantry_observability::tool_span;
///
/// let span = tool_span!("read_file");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! tool_span {
    ($tool:expr) => {
        tracing::info_span!(
            "tool.call",
            tool.name = $tool,
            duration_ms = tracing::field::Empty,
            error = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    };
}

/// Create a span for one MCP JSON-RPC round trip.
///
/// ```rust
/// use gantry_observability::mcp_span;
///
/// let span = mcp_span!("filesystem", "tools/call");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! mcp_span {
    ($server:expr, $method:expr) => {
        tracing::debug_span!(
            "mcp.request",
            mcp.server = $server,
            rpc.method = $method,
            duration_ms = tracing::field::Empty,
            error = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    };
}

/// Record an error on the current span and log it.
pub fn record_error<E: std::fmt::Display + ?Sized>(error: &E) {
    let span = tracing::Span::current();
    span.record("error", true);
    span.record("error.message", error.to_string().as_str());
    tracing::error!(error = %error, "Operation failed");
}

/// Record a duration (milliseconds) on the current span under `key`.
///
/// The field must have been declared when the span was created.
pub fn record_duration(key: &str, duration: std::time::Duration) {
    let span = tracing::Span::current();
    span.record(key, duration.as_millis() as u64);
}
