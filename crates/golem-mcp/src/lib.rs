//! Host-side MCP integration for golem.
//!
//! Speaks newline-delimited JSON-RPC 2.0 with stdio MCP servers: each
//! configured server is spawned as a child process, initialized with the
//! MCP handshake, and supervised through a per-server state machine.

pub mod client;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::{McpClient, ToolCallResult, ToolInfo, ToolsPage};
pub use config::{ServerConfig, TransportKind, load_server_config_file};
pub use error::McpError;
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use manager::{ServerManager, ServerState, ServerStateEvent, ServerStatus};
pub use protocol::{
    ClientInfo, InitializeResult, PROTOCOL_VERSION, ProtocolEngine, ServerInfo,
};
pub use transport::{StdioTransport, Transport, TransportEvent, TransportOptions};
