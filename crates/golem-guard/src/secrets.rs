//! Environment-sourced secret store and per-server env overlays.

use std::collections::HashMap;

/// Prefix identifying secret-bearing environment variables.
pub const DEFAULT_SECRET_PREFIX: &str = "GOLEM_MCP_";

/// Holds named secrets harvested from the host environment.
///
/// A secret named `MYSERVER_API_TOKEN` is injected into the child
/// environment of the server `myserver` (and only that server) when its
/// process is spawned.
#[derive(Debug, Clone, Default)]
pub struct SecretProvider {
    secrets: HashMap<String, String>,
}

impl SecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Harvest every `GOLEM_MCP_*` environment variable, storing the
    /// suffix as the secret name. Returns the number of secrets loaded.
    pub fn load_from_env(&mut self) -> usize {
        self.load_from_env_with_prefix(DEFAULT_SECRET_PREFIX)
    }

    pub fn load_from_env_with_prefix(&mut self, prefix: &str) -> usize {
        let mut loaded = 0;
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(prefix) {
                if !name.is_empty() {
                    self.secrets.insert(name.to_string(), value);
                    loaded += 1;
                }
            }
        }
        loaded
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Build the child environment for a server: the configured env
    /// overlaid with every secret scoped to the server's name. The
    /// secret's full name is the injected variable name. The store is
    /// not mutated; a fresh map is returned on each call.
    pub fn build_env(
        &self,
        server_name: &str,
        configured: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let prefix = server_env_prefix(server_name);
        let mut env = configured.clone();
        for (name, value) in &self.secrets {
            if name.starts_with(&prefix) {
                env.insert(name.clone(), value.clone());
            }
        }
        env
    }
}

/// Uppercase the server name, mapping non-alphanumerics to `_`, and
/// append the separating underscore: `my-server` → `MY_SERVER_`.
fn server_env_prefix(server_name: &str) -> String {
    let mut prefix: String = server_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    prefix.push('_');
    prefix
}
