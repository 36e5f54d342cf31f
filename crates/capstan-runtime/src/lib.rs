//! `capstan-runtime` – Engine Assembly
//!
//! Wires the kernel into a service: configuration, the request/response
//! surface, and process-wide tracing.
//!
//! # Modules
//!
//! - [`engine`] – [`Engine`][engine::Engine] and
//!   [`EngineConfig`][engine::EngineConfig]: builds the registry, executor,
//!   and audit log from one config and handles requests against them.
//! - [`api`] – [`ExecutionRequest`][api::ExecutionRequest],
//!   [`ExecutionResponse`][api::ExecutionResponse], and the mapping from
//!   typed failures to [`StatusClass`][api::StatusClass]es.  The request's
//!   JSON Schema is available from [`request_schema`][api::request_schema].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod api;
pub mod engine;
pub mod telemetry;

pub use api::{
    CallerIdentity, ExecutionRequest, ExecutionResponse, ListQuery, RequestError, StatusClass,
    request_schema,
};
pub use engine::{Engine, EngineConfig};
pub use telemetry::{TracerProviderGuard, init_tracing};

// Re-exported so service code can register capabilities without a direct
// dependency on the kernel crate.
pub use capstan_kernel::{Capability, CapabilityRegistry, ExecutionContext, FnCapability};
