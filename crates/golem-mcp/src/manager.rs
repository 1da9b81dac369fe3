//! Server manager — lifecycle of many configured MCP servers.
//!
//! Each server moves through `starting → running` on a successful
//! handshake, or `starting → error` (and eviction) on any startup
//! failure, so a failed name can immediately be started again.

use crate::client::McpClient;
use crate::config::{ServerConfig, TransportKind};
use crate::error::McpError;
use crate::protocol::ServerInfo;
use crate::transport::TransportOptions;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use golem_guard::SecretProvider;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

const STATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Observable state of one managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub name: String,
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub tool_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerState {
    fn new(name: &str, status: ServerStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            pid: None,
            capabilities: None,
            server_info: None,
            tool_count: 0,
            started_at: None,
            error: None,
        }
    }
}

/// A state transition, delivered to every subscriber as its own copy.
#[derive(Debug, Clone)]
pub struct ServerStateEvent {
    pub name: String,
    pub state: ServerState,
}

struct ManagedServer {
    config: ServerConfig,
    state: ServerState,
    client: Option<Arc<McpClient>>,
}

/// Owns every server's client; external callers reference servers by
/// name only.
pub struct ServerManager {
    /// Insertion order doubles as iteration order for `list` and the
    /// router's first-running-server fallback.
    servers: Mutex<Vec<ManagedServer>>,
    secrets: Option<SecretProvider>,
    events: broadcast::Sender<ServerStateEvent>,
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            servers: Mutex::new(Vec::new()),
            secrets: None,
            events,
        }
    }

    /// A manager that overlays scoped secrets into each child's env.
    pub fn with_secrets(secrets: SecretProvider) -> Self {
        let mut manager = Self::new();
        manager.secrets = Some(secrets);
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerStateEvent> {
        self.events.subscribe()
    }

    /// Spawn, handshake, and probe one server. On failure the slot is
    /// evicted after an `error` state-change, and the error propagates.
    pub async fn start(&self, config: ServerConfig) -> Result<ServerState, McpError> {
        if config.transport == TransportKind::Http {
            return Err(McpError::UnsupportedTransport {
                name: config.name.clone(),
                transport: config.transport.as_str().to_string(),
            });
        }

        let name = config.name.clone();
        {
            let mut servers = self.servers.lock().await;
            if let Some(pos) = servers.iter().position(|s| s.state.name == name) {
                if servers[pos].state.status == ServerStatus::Running {
                    return Err(McpError::AlreadyRunning { name });
                }
                servers.remove(pos);
            }
            let state = ServerState::new(&name, ServerStatus::Starting);
            servers.push(ManagedServer {
                config: config.clone(),
                state: state.clone(),
                client: None,
            });
            self.emit(&state);
        }

        match self.connect_and_probe(&config).await {
            Ok((client, state)) => {
                let mut servers = self.servers.lock().await;
                match servers.iter_mut().find(|s| s.state.name == name) {
                    Some(entry) => {
                        entry.state = state.clone();
                        entry.client = Some(client);
                    }
                    None => {
                        // Stopped while starting; last writer wins.
                        servers.push(ManagedServer {
                            config,
                            state: state.clone(),
                            client: Some(client),
                        });
                    }
                }
                drop(servers);
                self.emit(&state);
                Ok(state)
            }
            Err(err) => {
                let cause = err.to_string();
                {
                    let mut servers = self.servers.lock().await;
                    servers.retain(|s| s.state.name != name);
                }
                let mut state = ServerState::new(&name, ServerStatus::Error);
                state.error = Some(cause.clone());
                self.emit(&state);
                Err(McpError::StartupFailed { name, cause })
            }
        }
    }

    async fn connect_and_probe(
        &self,
        config: &ServerConfig,
    ) -> Result<(Arc<McpClient>, ServerState), McpError> {
        let env = match &self.secrets {
            Some(secrets) => secrets.build_env(&config.name, &config.env),
            None => config.env.clone(),
        };
        let client = McpClient::connect(TransportOptions {
            command: config.command.clone(),
            args: config.args.clone(),
            env,
        })
        .await?;

        let mut state = ServerState::new(&config.name, ServerStatus::Running);
        state.pid = client.pid();
        state.capabilities = Some(client.capabilities());
        state.server_info = Some(client.server_info());
        state.started_at = Some(Utc::now());
        // Eager tool probe; a failure here is non-fatal.
        state.tool_count = match client.list_tools(None).await {
            Ok(page) => page.tools.len(),
            Err(err) => {
                tracing::warn!("tool probe for '{}' failed: {err}", config.name);
                0
            }
        };
        Ok((Arc::new(client), state))
    }

    /// Disconnect and evict a server. Disconnect errors are swallowed;
    /// the slot is always cleared.
    pub async fn stop(&self, name: &str) -> Result<(), McpError> {
        let removed = {
            let mut servers = self.servers.lock().await;
            let pos = servers
                .iter()
                .position(|s| s.state.name == name)
                .ok_or_else(|| McpError::ServerNotFound {
                    name: name.to_string(),
                })?;
            servers.remove(pos)
        };

        if let Some(client) = removed.client {
            client.disconnect().await;
        }
        self.emit(&ServerState::new(name, ServerStatus::Stopped));
        Ok(())
    }

    /// Stop (if needed) and start a server again with its remembered
    /// config.
    pub async fn restart(&self, name: &str) -> Result<ServerState, McpError> {
        let config = {
            let servers = self.servers.lock().await;
            servers
                .iter()
                .find(|s| s.state.name == name)
                .map(|s| s.config.clone())
                .ok_or_else(|| McpError::ServerNotFound {
                    name: name.to_string(),
                })?
        };
        let _ = self.stop(name).await;
        self.start(config).await
    }

    /// Start every config; `auto_start == false` registers a stopped
    /// slot instead. Failures are recorded per server and do not abort
    /// the loop.
    pub async fn start_all(&self, configs: Vec<ServerConfig>) -> HashMap<String, ServerState> {
        let mut results = HashMap::new();
        for config in configs {
            let name = config.name.clone();
            if !config.auto_start {
                let state = self.register_stopped(config).await;
                results.insert(name, state);
                continue;
            }
            let state = match self.start(config).await {
                Ok(state) => state,
                Err(err) => {
                    let mut state = ServerState::new(&name, ServerStatus::Error);
                    state.error = Some(err.to_string());
                    state
                }
            };
            results.insert(name, state);
        }
        results
    }

    async fn register_stopped(&self, config: ServerConfig) -> ServerState {
        let mut servers = self.servers.lock().await;
        if let Some(pos) = servers.iter().position(|s| s.state.name == config.name) {
            if servers[pos].state.status == ServerStatus::Running {
                return servers[pos].state.clone();
            }
            servers.remove(pos);
        }
        let state = ServerState::new(&config.name, ServerStatus::Stopped);
        servers.push(ManagedServer {
            config,
            state: state.clone(),
            client: None,
        });
        state
    }

    /// Stop every known server; individual failures are ignored.
    pub async fn stop_all(&self) {
        let names: Vec<String> = {
            let servers = self.servers.lock().await;
            servers.iter().map(|s| s.state.name.clone()).collect()
        };
        let _ = join_all(names.iter().map(|name| self.stop(name))).await;
    }

    /// Snapshot of every known server's state, in insertion order.
    pub async fn list(&self) -> Vec<ServerState> {
        let servers = self.servers.lock().await;
        servers.iter().map(|s| s.state.clone()).collect()
    }

    pub async fn get(&self, name: &str) -> Option<ServerState> {
        let servers = self.servers.lock().await;
        servers
            .iter()
            .find(|s| s.state.name == name)
            .map(|s| s.state.clone())
    }

    pub async fn get_config(&self, name: &str) -> Option<ServerConfig> {
        let servers = self.servers.lock().await;
        servers
            .iter()
            .find(|s| s.state.name == name)
            .map(|s| s.config.clone())
    }

    /// The live client, only while the server is running.
    pub async fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        let servers = self.servers.lock().await;
        servers
            .iter()
            .find(|s| s.state.name == name && s.state.status == ServerStatus::Running)
            .and_then(|s| s.client.clone())
    }

    fn emit(&self, state: &ServerState) {
        let _ = self.events.send(ServerStateEvent {
            name: state.name.clone(),
            state: state.clone(),
        });
    }
}
