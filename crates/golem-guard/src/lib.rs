//! Security gate primitives for the golem MCP host: permission rules,
//! environment-sourced secrets, and the invocation audit log.

pub mod audit;
pub mod rules;
pub mod secrets;

pub use audit::{AuditAction, AuditEntry, AuditLog, AuditResult, redact_arguments};
pub use rules::{PermissionDecision, PermissionGuard, PermissionRule, Scope, evaluate_rules};
pub use secrets::SecretProvider;
