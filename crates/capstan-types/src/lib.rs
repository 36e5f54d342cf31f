//! `capstan-types` – shared data model for the Capstan capability engine.
//!
//! Leaf crate: value types only, no I/O and no async.
//!
//! # Modules
//!
//! - [`permission`] – [`Permission`] (what a capability requires) and
//!   [`PermissionLevel`] (what a caller holds), with the reachability rule
//!   between them.
//! - [`schema`] – [`ParameterSchema`] and [`ParameterType`].
//! - [`descriptor`] – [`CapabilityDescriptor`]: a capability's metadata and
//!   its parameter list.
//! - [`validation`] – [`ValidationOutcome`], [`SecurityRisk`] and
//!   [`ValidationLevel`].
//! - [`result`] – [`ExecutionResult`], [`FailureKind`] and the streaming
//!   [`StreamingEnvelope`].
//! - [`audit`] – [`AuditRecord`].
//! - [`error`] – [`CapError`], the closed error taxonomy.

pub mod audit;
pub mod descriptor;
pub mod error;
pub mod permission;
pub mod result;
pub mod schema;
pub mod validation;

pub use audit::{AuditEvent, AuditRecord};
pub use descriptor::{CapabilityDescriptor, DEFAULT_TIMEOUT_SECONDS, DescriptorBuilder};
pub use error::CapError;
pub use permission::{Permission, PermissionLevel};
pub use result::{ExecutionResult, FailureKind, StreamPhase, StreamingEnvelope};
pub use schema::{ParameterSchema, ParameterType};
pub use validation::{
    FieldMessages, RiskSeverity, SecurityRisk, ValidationFailure, ValidationLevel,
    ValidationOutcome,
};

/// Parameter map passed to and between capabilities.
pub type Params = serde_json::Map<String, serde_json::Value>;
