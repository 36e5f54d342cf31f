//! Audit records for highest-tier executions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Params;
use crate::permission::PermissionLevel;

/// Classification of an audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// An admin-tier capability is about to run.
    AdminExecution,
    /// An admin-tier capability is about to run in streaming mode.
    AdminStreamingExecution,
    /// An admin-tier capability was simulated without side effects.
    AdminDryRun,
}

/// One append-only audit entry.  Parameter values are redacted before the
/// record is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub capability: String,
    pub caller_id: String,
    pub permission: PermissionLevel,
    pub session_id: Option<String>,
    pub request_id: Uuid,
    pub parameters: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    pub event: AuditEvent,
}
