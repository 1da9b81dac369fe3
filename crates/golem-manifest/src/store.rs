//! Manifest persistence and tool lookup, backed by a JSON file.

use crate::error::ManifestError;
use crate::types::{Manifest, ManifestEntry};
use chrono::Utc;
use golem_mcp::{ServerConfig, ToolInfo};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Default manifest location, relative to the working directory.
pub const DEFAULT_MANIFEST_PATH: &str = ".golem/mcp-manifest.json";

/// In-memory manifest mirrored to a JSON file.
///
/// Loading tolerates a missing or corrupt file (a fresh manifest is
/// used instead); saving is the atomic publication step.
pub struct ManifestStore {
    path: PathBuf,
    manifest: Manifest,
}

impl ManifestStore {
    /// An empty store that will save to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            manifest: Manifest::default(),
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_MANIFEST_PATH)
    }

    /// Load the manifest at `path`. A missing file yields a fresh
    /// manifest; a corrupt file is replaced silently by a fresh one.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let manifest = match tokio::fs::read_to_string(&path).await {
            Ok(data) => match serde_json::from_str::<Manifest>(&data) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!("corrupt manifest at {}: {e}; starting fresh", path.display());
                    Manifest::default()
                }
            },
            Err(_) => Manifest::default(),
        };
        Self { path, manifest }
    }

    /// Write the manifest as pretty-printed JSON (atomic write:
    /// .tmp → rename), creating parent directories if needed.
    pub async fn save(&self) -> Result<(), ManifestError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(&self.manifest)?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Register or replace a server config.
    pub fn add_server(&mut self, config: ServerConfig) {
        self.manifest.upsert(config);
    }

    /// Remove a server; reports whether anything was removed.
    pub fn remove_server(&mut self, name: &str) -> bool {
        self.manifest.remove(name)
    }

    pub fn get_server(&self, name: &str) -> Option<&ManifestEntry> {
        self.manifest.get(name)
    }

    pub fn list_servers(&self) -> &[ManifestEntry] {
        &self.manifest.servers
    }

    pub fn update_capabilities(
        &mut self,
        name: &str,
        capabilities: Value,
    ) -> Result<(), ManifestError> {
        let entry = self.entry_mut(name)?;
        entry.capabilities = Some(capabilities);
        entry.last_discovered = Some(Utc::now());
        Ok(())
    }

    pub fn update_tools(&mut self, name: &str, tools: Vec<ToolInfo>) -> Result<(), ManifestError> {
        let entry = self.entry_mut(name)?;
        entry.tools = Some(tools);
        entry.last_discovered = Some(Utc::now());
        Ok(())
    }

    pub fn update_resources(
        &mut self,
        name: &str,
        resources: Vec<Value>,
    ) -> Result<(), ManifestError> {
        let entry = self.entry_mut(name)?;
        entry.resources = Some(resources);
        entry.last_discovered = Some(Utc::now());
        Ok(())
    }

    pub fn update_prompts(&mut self, name: &str, prompts: Vec<Value>) -> Result<(), ManifestError> {
        let entry = self.entry_mut(name)?;
        entry.prompts = Some(prompts);
        entry.last_discovered = Some(Utc::now());
        Ok(())
    }

    /// Every cached `(server, tool)` pair, preserving per-server order.
    pub fn all_tools(&self) -> Vec<(String, ToolInfo)> {
        let mut all = Vec::new();
        for entry in &self.manifest.servers {
            if let Some(tools) = &entry.tools {
                for tool in tools {
                    all.push((entry.name().to_string(), tool.clone()));
                }
            }
        }
        all
    }

    /// Resolve a qualified (`server.tool`) or unqualified tool name
    /// against the cached tool lists.
    ///
    /// Qualified lookups return `None` when the server is unknown, has
    /// no cached tools, or does not expose the tool. Unqualified
    /// lookups scan servers in insertion order and return the first
    /// match.
    pub fn find_tool(&self, qualified: &str) -> Option<(String, ToolInfo)> {
        if let Some((server, tool_name)) = qualified.split_once('.') {
            let entry = self.manifest.get(server)?;
            let tool = entry
                .tools
                .as_ref()?
                .iter()
                .find(|t| t.name == tool_name)?;
            return Some((server.to_string(), tool.clone()));
        }

        for entry in &self.manifest.servers {
            if let Some(tools) = &entry.tools {
                if let Some(tool) = tools.iter().find(|t| t.name == qualified) {
                    return Some((entry.name().to_string(), tool.clone()));
                }
            }
        }
        None
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut ManifestEntry, ManifestError> {
        self.manifest
            .get_mut(name)
            .ok_or_else(|| ManifestError::UnknownServer {
                name: name.to_string(),
            })
    }
}
