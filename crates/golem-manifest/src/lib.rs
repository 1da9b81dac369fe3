//! Persistent registry of known MCP servers: configs plus the tool,
//! resource, and prompt sets cached on the last discovery pass.

pub mod error;
pub mod store;
pub mod types;

pub use error::ManifestError;
pub use store::{DEFAULT_MANIFEST_PATH, ManifestStore};
pub use types::{MANIFEST_VERSION, Manifest, ManifestEntry};
