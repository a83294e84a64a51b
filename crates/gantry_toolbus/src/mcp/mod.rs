//! Model Context Protocol (MCP) support.
//!
//! Local server processes are spawned and spoken to with newline-delimited
//! JSON-RPC 2.0 over their stdin/stdout. Their tools are republished as
//! ordinary [`Tool`](crate::Tool)s named `server.tool`.
//!
//! # Architecture
//!
//! - **protocol**: JSON-RPC and MCP message types
//! - **transport**: how a client reaches its server (`McpConnector`)
//! - **config**: per-server configuration
//! - **client**: one connection, request correlation, lifecycle
//! - **manager**: the set of servers and their running clients
//! - **registry**: tool discovery across running servers
//! - **adapter**: a remote tool as a local `Tool`
//! - **error**: error types for MCP operations

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use adapter::McpToolAdapter;
pub use client::McpClient;
pub use config::McpServerConfig;
pub use error::{McpError, McpResult};
pub use manager::{McpServerManager, ServerTestResult};
pub use protocol::{
    CallToolRequest, CallToolResult, Content, Implementation, InitializeParams, InitializeResult,
    JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    McpTool, ToolAnnotations,
};
pub use registry::{McpToolInfo, McpToolRegistry};
pub use transport::{McpConnector, McpTransport, StdioConnector};
