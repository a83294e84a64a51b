//! Byte streams to an MCP server.
//!
//! [`McpConnector`] turns a [`McpServerConfig`] into an [`McpTransport`]. The
//! production connector spawns the configured command; tests plug in
//! in-memory pipes.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::mcp::config::McpServerConfig;
use crate::mcp::error::McpError;

/// Connected streams plus the process that owns them, if any.
pub struct McpTransport {
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub process: Option<Child>,
}

impl McpTransport {
    /// Wrap arbitrary streams (no child process).
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(writer),
            process: None,
        }
    }
}

impl std::fmt::Debug for McpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTransport")
            .field("pid", &self.process.as_ref().and_then(|p| p.id()))
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, config: &McpServerConfig) -> Result<McpTransport, McpError>;
}

/// Spawns the server as a child process speaking over stdin/stdout.
///
/// stderr is drained line by line into `debug!` logs and never parsed.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

#[async_trait]
impl McpConnector for StdioConnector {
    async fn connect(&self, config: &McpServerConfig) -> Result<McpTransport, McpError> {
        info!("[MCP:{}] Starting local server: {}", config.name, config.command);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(config.resolved_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::StartFailed(format!("{}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::StartFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::StartFailed("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[MCP:{}] stderr: {}", server, line);
                }
            });
        }

        debug!("[MCP:{}] Spawned pid {:?}", config.name, child.id());

        Ok(McpTransport {
            reader: Box::new(BufReader::new(stdout)),
            writer: Box::new(stdin),
            process: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_start_failed() {
        let config = McpServerConfig::new("ghost", "/definitely/not/a/real/binary");
        let err = StdioConnector.connect(&config).await.unwrap_err();
        assert!(matches!(err, McpError::StartFailed(msg) if msg.contains("/definitely/not")));
    }
}
