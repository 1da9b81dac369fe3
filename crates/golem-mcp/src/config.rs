//! Server configuration types and the server-config file loader.

use crate::error::McpError;
use golem_guard::PermissionRule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Which transport a configured server speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
        }
    }
}

fn default_auto_start() -> bool {
    true
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique identifier within the manager and the manifest.
    pub name: String,
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables merged over the host environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub transport: TransportKind,
    /// Whether `start_all` starts this server (default: true).
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Per-server tool rules; evaluated instead of the global rules
    /// when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionRule>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            transport: TransportKind::Stdio,
            auto_start: true,
            permissions: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct ServerConfigFile {
    servers: Option<Vec<ServerConfig>>,
}

/// Load server configs from a JSON file of the shape
/// `{"servers": [ServerConfig, …]}`. A file without a `servers` array
/// is rejected.
pub fn load_server_config_file(path: &Path) -> Result<Vec<ServerConfig>, McpError> {
    let invalid = |detail: String| McpError::InvalidConfigFile {
        path: path.display().to_string(),
        detail,
    };
    let data = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let file: ServerConfigFile =
        serde_json::from_str(&data).map_err(|e| invalid(e.to_string()))?;
    file.servers
        .ok_or_else(|| invalid("missing 'servers' array".to_string()))
}
