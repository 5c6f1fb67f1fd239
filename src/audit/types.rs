// Audit log types and structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Audit log entry representing a single auditable event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier for the audit entry
    pub id: String,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Operator or service that performed the action
    pub actor: Option<String>,
    /// Action that was performed
    pub action: AuditAction,
    /// Resource type that was affected
    pub resource_type: ResourceType,
    /// Key version name or token id
    pub resource_id: Option<String>,
    /// Severity level of the audit event
    pub level: AuditLevel,
    /// Whether the action was successful
    pub success: bool,
    /// Error message if the action failed
    pub error_message: Option<String>,
    /// Additional metadata about the event
    pub metadata: HashMap<String, String>,
}

/// Types of auditable actions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // Rotation
    KeyVersionCreated,
    KeyVersionPromoted,
    KeyVersionDemoted,
    KeyVersionDisabled,
    KeyVersionDestroyScheduled,

    // Operator overrides
    ForceDisable,
    ForceDestroy,

    // Tokens
    TokenIssued,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::KeyVersionCreated => "key_version_created",
            AuditAction::KeyVersionPromoted => "key_version_promoted",
            AuditAction::KeyVersionDemoted => "key_version_demoted",
            AuditAction::KeyVersionDisabled => "key_version_disabled",
            AuditAction::KeyVersionDestroyScheduled => "key_version_destroy_scheduled",
            AuditAction::ForceDisable => "force_disable",
            AuditAction::ForceDestroy => "force_destroy",
            AuditAction::TokenIssued => "token_issued",
        }
    }
}

/// Resource types that can be audited
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    KeyVersion,
    Token,
}

/// Severity level of audit events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    /// Routine operations
    Info,
    /// Unusual but not critical
    Warning,
    /// Security-relevant events
    Security,
    /// Manual overrides of key material
    Critical,
}

/// Query parameters for searching audit logs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<String>,
    pub success: Option<bool>,
    /// Filter by minimum severity level
    pub min_level: Option<AuditLevel>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum number of results to return
    pub limit: Option<usize>,
    /// Offset for pagination
    pub offset: Option<usize>,
}

impl AuditEntry {
    /// Create a new audit entry builder
    pub fn builder() -> AuditEntryBuilder {
        AuditEntryBuilder::default()
    }
}

/// Builder for creating audit entries
#[derive(Default)]
pub struct AuditEntryBuilder {
    actor: Option<String>,
    action: Option<AuditAction>,
    resource_type: Option<ResourceType>,
    resource_id: Option<String>,
    level: Option<AuditLevel>,
    success: Option<bool>,
    error_message: Option<String>,
    metadata: HashMap<String, String>,
}

impl AuditEntryBuilder {
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = Some(resource_type);
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn level(mut self, level: AuditLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self.success = Some(false);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> AuditEntry {
        AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: self.actor,
            action: self.action.unwrap_or(AuditAction::TokenIssued),
            resource_type: self.resource_type.unwrap_or(ResourceType::KeyVersion),
            resource_id: self.resource_id,
            level: self.level.unwrap_or(AuditLevel::Info),
            success: self.success.unwrap_or(true),
            error_message: self.error_message,
            metadata: self.metadata,
        }
    }
}
