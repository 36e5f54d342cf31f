//! Execution outcomes and streaming envelopes.

use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Params;

/// Closed failure taxonomy.  Exactly one kind describes a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    NotFound,
    PermissionDenied,
    ValidationFailed,
    Timeout,
    ResourceExhausted,
    ExecutionFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::NotFound => "notFound",
            FailureKind::PermissionDenied => "permissionDenied",
            FailureKind::ValidationFailed => "validationFailed",
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceExhausted => "resourceExhausted",
            FailureKind::ExecutionFailed => "executionFailed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one execution.
///
/// A successful result carries a payload and no error; a failed result
/// carries an error message, a [`FailureKind`], and no payload.  The fields
/// are private so the two shapes cannot be mixed.
///
/// ```
/// use capstan_types::{ExecutionResult, FailureKind};
/// use serde_json::json;
///
/// let ok = ExecutionResult::success(json!("hi"));
/// assert!(ok.is_success());
/// assert_eq!(ok.payload(), Some(&json!("hi")));
///
/// let failed = ExecutionResult::failure(FailureKind::Timeout, "execution timed out");
/// assert_eq!(failed.failure_kind(), Some(FailureKind::Timeout));
/// assert!(failed.payload().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_kind: Option<FailureKind>,
    #[serde(default)]
    metadata: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elapsed_seconds: Option<f64>,
}

impl ExecutionResult {
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            result: Some(payload),
            error: None,
            error_kind: None,
            metadata: Params::new(),
            elapsed_seconds: None,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
            error_kind: Some(kind),
            metadata: Params::new(),
            elapsed_seconds: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_seconds = Some(elapsed.as_secs_f64());
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn payload(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn into_payload(self) -> Option<Value> {
        self.result
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error_kind
    }

    pub fn metadata(&self) -> &Params {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Params {
        &mut self.metadata
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed_seconds
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}

/// Lifecycle of one streaming invocation.
///
/// `Initializing → Processing* → Finalizing → Completed`, with `Error`
/// reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamPhase {
    Initializing,
    Processing,
    Finalizing,
    Completed,
    Error,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamPhase::Completed | StreamPhase::Error)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: StreamPhase) -> bool {
        use StreamPhase::*;
        match (self, next) {
            (Completed | Error, _) => false,
            (_, Error) => true,
            (Initializing, Processing | Finalizing) => true,
            (Processing, Processing | Finalizing) => true,
            (Finalizing, Completed) => true,
            _ => false,
        }
    }
}

/// One unit of a streaming invocation's output.
///
/// Exactly one envelope per invocation is final; it has `completion == 1.0`
/// and carries the invocation's net result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StreamingEnvelope {
    pub sequence: u64,
    pub phase: StreamPhase,
    pub completion: f64,
    pub status: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(flatten)]
    pub result: ExecutionResult,
}
