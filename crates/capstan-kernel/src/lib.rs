//! `capstan-kernel` – Capability Dispatch
//!
//! The engine that resolves, authorizes, validates, and runs capabilities.
//!
//! # Modules
//!
//! - [`registry`] – [`CapabilityRegistry`][registry::CapabilityRegistry]:
//!   the authoritative index (by name, category, and tag) and the single
//!   entry point that ties lookup → permission → validation → audit →
//!   execution together.
//! - [`capability`] – the [`Capability`][capability::Capability] trait, the
//!   [`FnCapability`][capability::FnCapability] closure adapter, and the
//!   timeout/cancellation harness.
//! - [`validator`] – [`Validator`][validator::Validator]: type coercion,
//!   constraint checks, and pluggable [`RiskRule`][validator::RiskRule]s.
//! - [`executor`] – [`Executor`][executor::Executor]: resource pre-flight,
//!   dry runs, failure classification, and aggregate statistics.
//! - [`streaming`] – [`ProgressSink`][streaming::ProgressSink] and the
//!   ordered envelope stream for long-running capabilities.
//! - [`context`] – [`ExecutionContext`][context::ExecutionContext] and
//!   [`CancelFlag`][context::CancelFlag].
//! - [`audit`] – [`AuditLog`][audit::AuditLog]: bounded record of
//!   admin-tier executions.
//! - [`resource`] – [`ResourceProbe`][resource::ResourceProbe] and limits.
//! - [`redaction`] – sensitive-parameter masking.

pub mod audit;
pub mod capability;
pub mod context;
pub mod executor;
pub mod redaction;
pub mod registry;
pub mod resource;
pub mod streaming;
pub mod validator;

pub use audit::{AuditLog, DEFAULT_AUDIT_CAPACITY};
pub use capability::{Capability, FnCapability, execute_with_timeout};
pub use context::{CancelFlag, ENV_CAPABILITY, ENV_REQUEST_ID, ExecutionContext};
pub use executor::{ExecutionStats, Executor};
pub use registry::{Catalog, CapabilityRegistry, ListFilter, RegistryStats, ValidationReport};
pub use resource::{ProcfsProbe, ResourceLimits, ResourceProbe, ResourceSnapshot, StaticProbe};
pub use streaming::{EnvelopeStream, ProgressSink, final_result};
pub use validator::{
    CommandInjectionRule, NullByteRule, PathTraversalRule, RiskRule, ScriptInjectionRule,
    SqlInjectionRule, SystemPathRule, Validator,
};
