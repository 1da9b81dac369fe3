//! MCP client — one server connection: handshake plus typed
//! tool/resource/prompt operations.

use crate::error::McpError;
use crate::protocol::{ClientInfo, InitializeResult, ProtocolEngine, ServerInfo};
use crate::transport::{StdioTransport, Transport, TransportOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A tool exposed by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// One page of a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsPage {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// The result of a `tools/call`. Content items are passed through
/// opaquely; only the error flag is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// Client for a single MCP server. Owns the protocol engine, which owns
/// the transport.
pub struct McpClient {
    engine: ProtocolEngine,
    init: InitializeResult,
    tool_cache: Mutex<Option<Vec<ToolInfo>>>,
}

impl McpClient {
    /// Spawn a stdio server and run the MCP handshake.
    pub async fn connect(options: TransportOptions) -> Result<Self, McpError> {
        let transport: Arc<dyn Transport> = Arc::new(StdioTransport::new(options));
        Self::connect_with_transport(transport).await
    }

    /// Run the handshake over an existing (not yet started) transport.
    pub async fn connect_with_transport(transport: Arc<dyn Transport>) -> Result<Self, McpError> {
        let engine = ProtocolEngine::new(Arc::clone(&transport));
        transport.start().await?;

        let client_info = ClientInfo::default();
        let init = match engine.initialize(&client_info, json!({})).await {
            Ok(init) => init,
            Err(err) => {
                transport.close().await;
                return Err(err);
            }
        };
        tracing::info!(
            "connected to MCP server '{}' (protocol {})",
            init.server_info.name,
            init.protocol_version
        );

        Ok(Self {
            engine,
            init,
            tool_cache: Mutex::new(None),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_initialized()
    }

    pub fn server_info(&self) -> ServerInfo {
        self.init.server_info.clone()
    }

    pub fn capabilities(&self) -> Value {
        self.init.capabilities.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.engine.transport().pid()
    }

    /// Register a handler for server-initiated notifications.
    pub fn on_notification(&self, method: &str, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.engine.on_notification(method, handler);
    }

    /// List tools, forwarding the pagination cursor when given.
    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ToolsPage, McpError> {
        self.ensure_initialized()?;
        let params = cursor.map(|c| json!({"cursor": c}));
        let result = self.engine.request("tools/list", params).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/list result: {e}")))
    }

    /// Look up one tool by name, listing and caching the tool array on
    /// first use. The cache lives until `disconnect`.
    pub async fn get_tool(&self, name: &str) -> Result<Option<ToolInfo>, McpError> {
        self.ensure_initialized()?;
        let mut cache = self.tool_cache.lock().await;
        if cache.is_none() {
            let page = self.list_tools(None).await?;
            *cache = Some(page.tools);
        }
        Ok(cache
            .as_ref()
            .and_then(|tools| tools.iter().find(|t| t.name == name).cloned()))
    }

    /// Invoke a tool. `arguments` is omitted from the wire when `None`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResult, McpError> {
        self.ensure_initialized()?;
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self.engine.request("tools/call", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {e}")))
    }

    /// List resources; the result is passed through opaquely.
    pub async fn list_resources(&self, cursor: Option<&str>) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        let params = cursor.map(|c| json!({"cursor": c}));
        self.engine.request("resources/list", params).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        self.engine
            .request("resources/read", Some(json!({"uri": uri})))
            .await
    }

    /// List prompts; the result is passed through opaquely.
    pub async fn list_prompts(&self, cursor: Option<&str>) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        let params = cursor.map(|c| json!({"cursor": c}));
        self.engine.request("prompts/list", params).await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value, McpError> {
        self.ensure_initialized()?;
        let mut params = json!({"name": name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.engine.request("prompts/get", Some(params)).await
    }

    /// Shut down the connection: best-effort protocol shutdown, then
    /// transport close. Never fails; cleanup always completes.
    pub async fn disconnect(&self) {
        self.engine.shutdown().await;
        self.engine.transport().close().await;
        self.tool_cache.lock().await.take();
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        if self.engine.is_initialized() {
            Ok(())
        } else {
            Err(McpError::NotInitialized)
        }
    }
}
