//! Permission rules — server allowlist + tool rule evaluation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Access scope a tool invocation may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Execute,
    Network,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Execute => "execute",
            Scope::Network => "network",
        }
    }
}

/// A single permission rule matching a tool name pattern.
///
/// The pattern is a literal tool name, a glob containing `*`
/// (e.g., `file_*`), or the bare catch-all `"*"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub tool: String,
    pub allow: bool,
    /// Scopes granted by this rule. `None` means the rule does not
    /// constrain scopes at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<Scope>>,
}

/// The outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allowed,
    Denied { reason: String },
}

impl PermissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PermissionDecision::Allowed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PermissionDecision::Allowed => None,
            PermissionDecision::Denied { reason } => Some(reason),
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        PermissionDecision::Denied {
            reason: reason.into(),
        }
    }
}

/// Server allowlist + global tool rules.
#[derive(Debug, Clone, Default)]
pub struct PermissionGuard {
    /// `None` means no restriction; an empty set denies every server.
    allowlist: Option<HashSet<String>>,
    rules: Vec<PermissionRule>,
}

impl PermissionGuard {
    pub fn new(allowlist: Option<Vec<String>>, rules: Vec<PermissionRule>) -> Self {
        Self {
            allowlist: allowlist.map(|names| names.into_iter().collect()),
            rules,
        }
    }

    /// A guard with no allowlist and no rules: everything is permitted.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[PermissionRule] {
        &self.rules
    }

    pub fn is_server_allowed(&self, name: &str) -> PermissionDecision {
        match &self.allowlist {
            None => PermissionDecision::Allowed,
            Some(allowed) if allowed.contains(name) => PermissionDecision::Allowed,
            Some(_) => {
                PermissionDecision::denied(format!("server '{name}' is not in the allowlist"))
            }
        }
    }

    /// Evaluate this guard's global rules against a tool name.
    pub fn check_tool(
        &self,
        tool_name: &str,
        required_scopes: Option<&[Scope]>,
    ) -> PermissionDecision {
        evaluate_rules(&self.rules, tool_name, required_scopes)
    }
}

/// Evaluate a rule list against a tool name and optional required scopes.
///
/// An empty rule list permits everything. Otherwise the matching rule is
/// found with fixed precedence: exact name, then glob (`*`-containing,
/// excluding the bare catch-all), then `"*"`. Within each bucket the
/// first rule in insertion order wins.
pub fn evaluate_rules(
    rules: &[PermissionRule],
    tool_name: &str,
    required_scopes: Option<&[Scope]>,
) -> PermissionDecision {
    if rules.is_empty() {
        return PermissionDecision::Allowed;
    }

    let matched = rules
        .iter()
        .find(|r| r.tool == tool_name)
        .or_else(|| {
            rules
                .iter()
                .filter(|r| r.tool != "*" && r.tool.contains('*'))
                .find(|r| glob_matches(&r.tool, tool_name))
        })
        .or_else(|| rules.iter().find(|r| r.tool == "*"));

    let Some(rule) = matched else {
        return PermissionDecision::denied("no rule matched");
    };

    if !rule.allow {
        return PermissionDecision::denied("explicitly denied");
    }

    if let Some(required) = required_scopes {
        if !required.is_empty() {
            if let Some(granted) = &rule.scopes {
                let missing: Vec<&str> = required
                    .iter()
                    .filter(|scope| !granted.contains(scope))
                    .map(Scope::as_str)
                    .collect();
                if !missing.is_empty() {
                    return PermissionDecision::denied(format!(
                        "missing scopes: {}",
                        missing.join(", ")
                    ));
                }
            }
        }
    }

    PermissionDecision::Allowed
}

fn glob_matches(pattern: &str, tool_name: &str) -> bool {
    match globset::GlobBuilder::new(pattern)
        .case_insensitive(false)
        .build()
    {
        Ok(glob) => glob.compile_matcher().is_match(tool_name),
        // If glob fails to parse, fall back to exact match
        Err(_) => pattern == tool_name,
    }
}
