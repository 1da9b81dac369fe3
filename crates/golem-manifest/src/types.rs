//! Manifest data model: the persisted server registry with cached
//! discovery results.

use chrono::{DateTime, Utc};
use golem_mcp::ServerConfig;
use golem_mcp::ToolInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MANIFEST_VERSION: &str = "1.0";

/// One registered server: its config plus whatever was cached on the
/// last discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub config: ServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<Value>>,
    /// Held as a UTC timestamp in memory, ISO-8601 on disk, re-parsed
    /// on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_discovered: Option<DateTime<Utc>>,
}

impl ManifestEntry {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            capabilities: None,
            tools: None,
            resources: None,
            prompts: None,
            last_discovered: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// The whole manifest. Entries keep insertion order; the `servers` map
/// serializes in that order and deserializes in document order, so the
/// order survives a save/load round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(with = "ordered_servers")]
    pub servers: Vec<ManifestEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            servers: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.servers.iter().find(|e| e.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ManifestEntry> {
        self.servers.iter_mut().find(|e| e.name() == name)
    }

    /// Insert or replace a server's config, keeping its position and
    /// cached discovery data on replace.
    pub fn upsert(&mut self, config: ServerConfig) {
        match self.get_mut(&config.name) {
            Some(entry) => entry.config = config,
            None => self.servers.push(ManifestEntry::new(config)),
        }
    }

    /// Remove a server; reports whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|e| e.name() != name);
        self.servers.len() != before
    }
}

mod ordered_servers {
    use super::ManifestEntry;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        entries: &[ManifestEntry],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for entry in entries {
            map.serialize_entry(entry.name(), entry)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ManifestEntry>, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<ManifestEntry>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of server name to manifest entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                // The key is redundant; `entry.config.name` is
                // authoritative.
                while let Some((_name, entry)) = access.next_entry::<String, ManifestEntry>()? {
                    entries.push(entry);
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
