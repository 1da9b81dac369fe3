//! Tool routing: resolve a tool name against the manifest and the
//! running fleet, gate it through the permission rules, dispatch it to
//! the owning server's client, and audit the outcome.

use golem_guard::{AuditLog, AuditResult, PermissionDecision, PermissionGuard, evaluate_rules};
use golem_manifest::ManifestStore;
use golem_mcp::client::{ToolCallResult, ToolInfo};
use golem_mcp::manager::{ServerManager, ServerStatus};
use golem_mcp::McpError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// A routed, completed tool invocation.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub server: String,
    pub tool: String,
    pub result: ToolCallResult,
    pub duration_ms: u64,
}

pub struct ToolRouter {
    manager: Arc<ServerManager>,
    manifest: Arc<Mutex<ManifestStore>>,
    guard: PermissionGuard,
    audit: Arc<AuditLog>,
}

impl ToolRouter {
    pub fn new(
        manager: Arc<ServerManager>,
        manifest: Arc<Mutex<ManifestStore>>,
        guard: PermissionGuard,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            manager,
            manifest,
            guard,
            audit,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Resolve, authorize, and dispatch a tool call.
    ///
    /// Unqualified names resolve against the manifest's cached tool
    /// lists first. When no cache matches, the call falls back to the
    /// first running server, which may not actually expose the tool.
    /// Qualify names as `server.tool` to avoid the fallback.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: Option<Value>,
    ) -> Result<InvokeOutcome, McpError> {
        let (server, tool_name) = self.resolve(qualified_name).await?;

        let decision = self.check_permission(&server, &tool_name).await;
        if let Some(reason) = decision.reason() {
            self.audit.log_denial(&server, &tool_name, reason);
            return Err(McpError::PermissionDenied {
                reason: reason.to_string(),
            });
        }

        let client = self
            .manager
            .get_client(&server)
            .await
            .ok_or_else(|| McpError::ServerNotRunning {
                name: server.clone(),
            })?;

        let started = Instant::now();
        match client.call_tool(&tool_name, arguments.clone()).await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let outcome = if result.is_error {
                    AuditResult::Failure
                } else {
                    AuditResult::Success
                };
                self.audit.log_invocation(
                    &server,
                    &tool_name,
                    arguments.as_ref(),
                    Some(outcome),
                    Some(duration_ms),
                );
                Ok(InvokeOutcome {
                    server,
                    tool: tool_name,
                    result,
                    duration_ms,
                })
            }
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.audit.log_invocation(
                    &server,
                    &tool_name,
                    arguments.as_ref(),
                    Some(AuditResult::Failure),
                    Some(duration_ms),
                );
                Err(err)
            }
        }
    }

    /// List tools across every running server, refreshing the
    /// manifest's per-server tool caches. Servers whose listing fails
    /// are skipped; their previously cached tools stay untouched.
    pub async fn list_all_tools(&self) -> Vec<(String, ToolInfo)> {
        let mut all = Vec::new();
        for state in self.manager.list().await {
            if state.status != ServerStatus::Running {
                continue;
            }
            let Some(client) = self.manager.get_client(&state.name).await else {
                continue;
            };
            match client.list_tools(None).await {
                Ok(page) => {
                    for tool in &page.tools {
                        all.push((state.name.clone(), tool.clone()));
                    }
                    let mut manifest = self.manifest.lock().await;
                    if manifest.update_tools(&state.name, page.tools).is_err() {
                        tracing::debug!("server '{}' has no manifest entry to cache", state.name);
                    }
                }
                Err(err) => {
                    tracing::warn!("tools/list on '{}' failed: {err}", state.name);
                }
            }
        }
        all
    }

    /// Qualified split → manifest lookup → first-running-server
    /// fallback.
    async fn resolve(&self, qualified_name: &str) -> Result<(String, String), McpError> {
        if let Some((server, tool)) = qualified_name.split_once('.') {
            // The server's existence is checked at dispatch, not here.
            return Ok((server.to_string(), tool.to_string()));
        }

        {
            let manifest = self.manifest.lock().await;
            if let Some((server, tool)) = manifest.find_tool(qualified_name) {
                return Ok((server, tool.name));
            }
        }

        let first_running = self
            .manager
            .list()
            .await
            .into_iter()
            .find(|s| s.status == ServerStatus::Running);
        if let Some(state) = first_running {
            return Ok((state.name, qualified_name.to_string()));
        }

        Err(McpError::ToolNotFound {
            name: qualified_name.to_string(),
        })
    }

    /// Server allowlist first; then the server's own rules when it has
    /// any, otherwise the guard's global rules.
    async fn check_permission(&self, server: &str, tool_name: &str) -> PermissionDecision {
        let decision = self.guard.is_server_allowed(server);
        if !decision.is_allowed() {
            return decision;
        }

        let manifest = self.manifest.lock().await;
        match manifest
            .get_server(server)
            .filter(|entry| !entry.config.permissions.is_empty())
        {
            Some(entry) => evaluate_rules(&entry.config.permissions, tool_name, None),
            None => self.guard.check_tool(tool_name, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use golem_guard::{AuditAction, PermissionRule};
    use golem_mcp::ServerConfig;
    use serde_json::json;

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn manifest_with_tools() -> ManifestStore {
        let mut store = ManifestStore::new("unused.json");
        store.add_server(ServerConfig::new("srv1", "cmd"));
        store.add_server(ServerConfig::new("srv2", "cmd"));
        store.update_tools("srv1", vec![tool("echo")]).unwrap();
        store.update_tools("srv2", vec![tool("add")]).unwrap();
        store
    }

    fn router(manifest: ManifestStore, guard: PermissionGuard) -> ToolRouter {
        ToolRouter::new(
            Arc::new(ServerManager::new()),
            Arc::new(Mutex::new(manifest)),
            guard,
            Arc::new(AuditLog::new()),
        )
    }

    #[tokio::test]
    async fn denied_tool_is_audited_and_rejected() {
        let guard = PermissionGuard::new(
            None,
            vec![PermissionRule {
                tool: "blocked".to_string(),
                allow: false,
                scopes: None,
            }],
        );
        let mut manifest = ManifestStore::new("unused.json");
        manifest.add_server(ServerConfig::new("srv", "cmd"));
        manifest.update_tools("srv", vec![tool("blocked")]).unwrap();
        let router = router(manifest, guard);

        let err = router.invoke("blocked", None).await.unwrap_err();
        assert!(err.to_string().contains("Permission denied"));

        let denials = router.audit().for_server("srv");
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].action, AuditAction::Deny);
        assert_eq!(denials[0].tool, "blocked");
    }

    #[tokio::test]
    async fn per_server_rules_override_global_rules() {
        // Globally everything is allowed, but srv1 denies echo itself.
        let mut config = ServerConfig::new("srv1", "cmd");
        config.permissions = vec![PermissionRule {
            tool: "echo".to_string(),
            allow: false,
            scopes: None,
        }];
        let mut manifest = ManifestStore::new("unused.json");
        manifest.add_server(config);
        manifest.update_tools("srv1", vec![tool("echo")]).unwrap();
        let router = router(manifest, PermissionGuard::permissive());

        let err = router.invoke("srv1.echo", None).await.unwrap_err();
        assert!(matches!(err, McpError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn server_allowlist_is_enforced() {
        let guard = PermissionGuard::new(Some(vec!["srv2".to_string()]), vec![]);
        let router = router(manifest_with_tools(), guard);

        let err = router.invoke("srv1.echo", None).await.unwrap_err();
        assert!(matches!(err, McpError::PermissionDenied { .. }));
        assert_eq!(router.audit().for_server("srv1").len(), 1);
    }

    #[tokio::test]
    async fn qualified_name_skips_manifest_but_requires_running_server() {
        let router = router(manifest_with_tools(), PermissionGuard::permissive());
        // Resolution succeeds without verifying the server; dispatch
        // then fails because nothing is running.
        let err = router.invoke("ghost.sometool", None).await.unwrap_err();
        assert!(matches!(err, McpError::ServerNotRunning { ref name } if name == "ghost"));
    }

    #[tokio::test]
    async fn unqualified_name_resolves_through_manifest() {
        let router = router(manifest_with_tools(), PermissionGuard::permissive());
        let err = router.invoke("add", None).await.unwrap_err();
        // Resolved to srv2 via the manifest cache; srv2 is not running.
        assert!(matches!(err, McpError::ServerNotRunning { ref name } if name == "srv2"));
    }

    #[tokio::test]
    async fn unknown_tool_with_no_running_server_is_not_found() {
        let router = router(manifest_with_tools(), PermissionGuard::permissive());
        let err = router.invoke("nonexistent", None).await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound { ref name } if name == "nonexistent"));
    }

    #[tokio::test]
    async fn list_all_tools_with_no_running_servers_is_empty() {
        let router = router(manifest_with_tools(), PermissionGuard::permissive());
        assert!(router.list_all_tools().await.is_empty());
        // Cached manifest tools are untouched.
        let manifest = router.manifest.lock().await;
        assert_eq!(manifest.all_tools().len(), 2);
    }
}
