//! Request/response surface for callers outside the process.
//!
//! | Failure                                   | [`StatusClass`] | Body                     |
//! |-------------------------------------------|-----------------|--------------------------|
//! | unknown capability                        | `NotFound`      | generic message          |
//! | tier does not reach required permission   | `Forbidden`     | generic message          |
//! | parameter validation                      | `BadRequest`    | field errors, warnings   |
//! | timeout / resources / execution failure   | `Ok`            | `success: false` result  |
//!
//! Attempted executions always come back as a structured outcome; only the
//! gate failures above map to non-`Ok` classes.

use std::time::Duration;

use capstan_types::{
    CapError, ExecutionResult, FailureKind, FieldMessages, Params, Permission, PermissionLevel,
    SecurityRisk,
};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Malformed input at the request boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid timeout override: {0}")]
    InvalidTimeout(f64),
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// One execution request.  Identity travels separately, in
/// [`CallerIdentity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub capability_name: String,
    #[serde(default)]
    pub parameters: Params,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_override_seconds: Option<f64>,
    /// Caller-chosen correlation id.  A fresh one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
}

impl ExecutionRequest {
    pub fn new(capability_name: impl Into<String>, parameters: Params) -> Self {
        Self {
            capability_name: capability_name.into(),
            parameters,
            dry_run: false,
            timeout_override_seconds: None,
            request_id: None,
        }
    }

    /// Parse a JSON request body.
    pub fn from_json(raw: &str) -> Result<Self, RequestError> {
        serde_json::from_str(raw).map_err(|e| RequestError::Malformed(e.to_string()))
    }

    /// The override as a [`Duration`].  Zero or absent means "none".
    ///
    /// # Errors
    ///
    /// [`RequestError::InvalidTimeout`] for negative or non-finite values.
    pub fn timeout_override(&self) -> Result<Option<Duration>, RequestError> {
        match self.timeout_override_seconds {
            None => Ok(None),
            Some(s) if s == 0.0 => Ok(None),
            Some(s) => Duration::try_from_secs_f64(s)
                .map(Some)
                .map_err(|_| RequestError::InvalidTimeout(s)),
        }
    }
}

/// JSON Schema of [`ExecutionRequest`], for clients that generate requests.
pub fn request_schema() -> Value {
    serde_json::to_value(schema_for!(ExecutionRequest)).unwrap_or(Value::Null)
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub caller_id: String,
    pub permission: PermissionLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl CallerIdentity {
    pub fn new(caller_id: impl Into<String>, permission: PermissionLevel) -> Self {
        Self {
            caller_id: caller_id.into(),
            permission,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Listing filters.  Always further restricted to the caller's tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub category: Option<String>,
    pub tag: Option<String>,
    pub required_permission: Option<Permission>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-neutral status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum StatusClass {
    Ok,
    NotFound,
    Forbidden,
    BadRequest,
}

impl StatusClass {
    /// The matching HTTP status code.
    pub fn http_code(self) -> u16 {
        match self {
            StatusClass::Ok => 200,
            StatusClass::NotFound => 404,
            StatusClass::Forbidden => 403,
            StatusClass::BadRequest => 400,
        }
    }
}

/// Outcome of one request, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub status: StatusClass,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_errors: Option<FieldMessages>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<FieldMessages>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_risks: Vec<SecurityRisk>,
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub metadata: Params,
}

impl From<ExecutionResult> for ExecutionResponse {
    fn from(result: ExecutionResult) -> Self {
        let elapsed_seconds = result.elapsed().map_or(0.0, |d| d.as_secs_f64());
        let error = result.error().map(str::to_string);
        let error_kind = result.failure_kind();
        let success = result.is_success();
        let metadata = result.metadata().clone();
        Self {
            status: StatusClass::Ok,
            success,
            result: result.into_payload(),
            error,
            error_kind,
            field_errors: None,
            warnings: None,
            security_risks: Vec::new(),
            elapsed_seconds,
            metadata,
        }
    }
}

impl ExecutionResponse {
    /// Map a gate error to its response.  Only class-level text is exposed.
    pub fn from_error(err: &CapError) -> Self {
        let status = match err {
            CapError::NotFound(_) => StatusClass::NotFound,
            CapError::PermissionDenied { .. } => StatusClass::Forbidden,
            _ => StatusClass::BadRequest,
        };
        let mut response = Self {
            status,
            success: false,
            result: None,
            error: Some(err.public_message()),
            error_kind: err.kind(),
            field_errors: None,
            warnings: None,
            security_risks: Vec::new(),
            elapsed_seconds: 0.0,
            metadata: Params::new(),
        };
        if let CapError::ValidationFailed(failure) = err {
            response.field_errors = Some(failure.errors.clone());
            response.warnings = Some(failure.warnings.clone());
            response.security_risks = failure.security_risks.clone();
            response.metadata.insert(
                "providedParameters".into(),
                Value::Object(failure.provided_parameters.clone()),
            );
        }
        response
    }

    /// A bad-request response for input that never reached the registry.
    pub fn malformed(err: &RequestError) -> Self {
        Self {
            status: StatusClass::BadRequest,
            success: false,
            result: None,
            error: Some(err.to_string()),
            error_kind: None,
            field_errors: None,
            warnings: None,
            security_risks: Vec::new(),
            elapsed_seconds: 0.0,
            metadata: Params::new(),
        }
    }
}
