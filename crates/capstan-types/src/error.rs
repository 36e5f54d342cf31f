//! Error taxonomy shared by every Capstan crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::permission::{Permission, PermissionLevel};
use crate::result::FailureKind;
use crate::validation::ValidationFailure;

/// Every typed failure the engine can produce.
///
/// `Display` may carry internal detail and is meant for logs.  Use
/// [`CapError::public_message`] for anything returned to a caller.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapError {
    #[error("capability not found: {0}")]
    NotFound(String),

    #[error("capability already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid schema for {capability}.{parameter}: {reason}")]
    InvalidSchema {
        capability: String,
        parameter: String,
        reason: String,
    },

    #[error("permission denied: {capability} requires {required}, caller is {caller}")]
    PermissionDenied {
        capability: String,
        required: Permission,
        caller: PermissionLevel,
    },

    #[error("parameter validation failed: {}", .0.error_summary())]
    ValidationFailed(Box<ValidationFailure>),

    #[error("execution timed out after {seconds:.3}s")]
    Timeout { seconds: f64 },

    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl CapError {
    /// The execution failure class, or `None` for registration errors.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            CapError::NotFound(_) => Some(FailureKind::NotFound),
            CapError::PermissionDenied { .. } => Some(FailureKind::PermissionDenied),
            CapError::ValidationFailed(_) => Some(FailureKind::ValidationFailed),
            CapError::Timeout { .. } => Some(FailureKind::Timeout),
            CapError::ResourceExhausted(_) => Some(FailureKind::ResourceExhausted),
            CapError::ExecutionFailed(_) => Some(FailureKind::ExecutionFailed),
            CapError::AlreadyRegistered(_) | CapError::InvalidSchema { .. } => None,
        }
    }

    /// Generic, class-level text safe to hand to a caller.
    ///
    /// Validation failures list field errors, which never contain parameter
    /// values.
    pub fn public_message(&self) -> String {
        match self {
            CapError::NotFound(name) => format!("Capability '{name}' not found"),
            CapError::AlreadyRegistered(name) => format!("Capability '{name}' is already registered"),
            CapError::InvalidSchema { capability, .. } => {
                format!("Capability '{capability}' has an invalid schema")
            }
            CapError::PermissionDenied { capability, .. } => {
                format!("Permission denied for capability '{capability}'")
            }
            CapError::ValidationFailed(failure) => {
                format!("Parameter validation failed: {}", failure.error_summary())
            }
            CapError::Timeout { .. } => "Capability execution timed out".to_string(),
            CapError::ResourceExhausted(_) => "Insufficient resources to execute capability".to_string(),
            CapError::ExecutionFailed(_) => "Capability execution failed".to_string(),
        }
    }
}
