//! Append-only audit log with bounded retention and argument redaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum entries retained before oldest-first eviction.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Default number of entries returned by `recent` queries.
pub const DEFAULT_RECENT: usize = 50;

const REDACTED: &str = "[REDACTED]";

/// Top-level argument keys containing any of these (case-insensitive)
/// are redacted before an entry is recorded.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Invoke,
    Deny,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
}

/// One immutable record of an invocation attempt or denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub server: String,
    pub tool: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AuditResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Bounded in-memory ring of audit entries. Shareable via `Arc`; all
/// methods take `&self`.
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting oldest entries beyond capacity.
    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Record a tool invocation, redacting sensitive argument fields.
    pub fn log_invocation(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<&Value>,
        result: Option<AuditResult>,
        duration_ms: Option<u64>,
    ) {
        self.record(AuditEntry {
            timestamp: Utc::now(),
            server: server.to_string(),
            tool: tool.to_string(),
            action: AuditAction::Invoke,
            arguments: arguments.map(redact_arguments),
            result,
            reason: None,
            duration_ms,
        });
    }

    /// Record a permission denial.
    pub fn log_denial(&self, server: &str, tool: &str, reason: &str) {
        self.record(AuditEntry {
            timestamp: Utc::now(),
            server: server.to_string(),
            tool: tool.to_string(),
            action: AuditAction::Deny,
            arguments: None,
            result: None,
            reason: Some(reason.to_string()),
            duration_ms: None,
        });
    }

    /// The last `count` entries in insertion order.
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(count);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Every entry for the given server, in insertion order.
    pub fn for_server(&self, server: &str) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|e| e.server == server)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Replace the value of any sensitive top-level key with `[REDACTED]`.
/// Redaction is shallow; nested objects are left untouched.
pub fn redact_arguments(arguments: &Value) -> Value {
    let Value::Object(map) = arguments else {
        return arguments.clone();
    };

    let redacted = map
        .iter()
        .map(|(key, value)| {
            let lower = key.to_lowercase();
            if SENSITIVE_KEY_FRAGMENTS.iter().any(|f| lower.contains(f)) {
                (key.clone(), Value::String(REDACTED.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect();
    Value::Object(redacted)
}
