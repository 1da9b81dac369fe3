//! Error types for MCP transport, protocol, and server management.

use thiserror::Error;

/// Errors from MCP server communication and lifecycle management.
#[derive(Debug, Error)]
pub enum McpError {
    // Transport
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport already started")]
    AlreadyStarted,

    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited immediately with code {code:?}")]
    ProcessExitedImmediately { code: Option<i32> },

    #[error("failed to write to child stdin: {0}")]
    WriteFailed(String),

    // Protocol
    #[error("request '{method}' (id {id}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        method: String,
        id: i64,
        timeout_ms: u64,
    },

    #[error("transport closed (exit code {exit_code:?})")]
    TransportClosed { exit_code: Option<i32> },

    #[error("server error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("protocol engine is shutting down")]
    ShuttingDown,

    #[error("client is not initialized")]
    NotInitialized,

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    // Manager
    #[error("server '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("server '{name}' not found")]
    ServerNotFound { name: String },

    #[error("server '{name}' failed to start: {cause}")]
    StartupFailed { name: String, cause: String },

    #[error("server '{name}' is not running")]
    ServerNotRunning { name: String },

    #[error("server '{name}' uses transport '{transport}', which is not supported")]
    UnsupportedTransport { name: String, transport: String },

    // Router
    #[error("tool '{name}' not found")]
    ToolNotFound { name: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    // Config
    #[error("invalid server config file '{path}': {detail}")]
    InvalidConfigFile { path: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
