//! The [`Capability`] trait and its timeout/cancellation harness.
//!
//! Implementors supply a descriptor and an async body.  Everything else –
//! validation, permission checks, resource pre-flight, timing – happens
//! around the body, never inside it.
//!
//! Closures can be registered directly through [`FnCapability`]:
//!
//! ```
//! use capstan_kernel::{Capability, FnCapability};
//! use capstan_types::{CapabilityDescriptor, ParameterSchema, ParameterType};
//! use serde_json::json;
//!
//! let descriptor = CapabilityDescriptor::builder("echo")
//!     .parameter(ParameterSchema::required("message", ParameterType::String, "text"))
//!     .build()
//!     .unwrap();
//!
//! let echo = FnCapability::new(descriptor, |_ctx, params| async move {
//!     Ok(json!(params.get("message").cloned()))
//! });
//! assert_eq!(echo.name(), "echo");
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use capstan_types::{CapError, CapabilityDescriptor, FieldMessages, Params, ValidationLevel};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::warn;

use crate::context::ExecutionContext;
use crate::validator::Validator;

/// A named, schema-described unit of work.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Immutable metadata.  Must return the same descriptor on every call.
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Run the body.  `params` has already been validated and converted.
    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<Value, CapError>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Structural check of `params` against the schema.  Empty means valid.
    fn validate(&self, params: &Params) -> FieldMessages {
        Validator::new()
            .validate(self.descriptor(), params, ValidationLevel::Basic)
            .errors
    }

    /// `params` with every absent optional parameter set to its default.
    fn apply_defaults(&self, params: &Params) -> Params {
        self.descriptor().apply_defaults(params)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FnCapability
// ────────────────────────────────────────────────────────────────────────────

/// Adapter turning an async closure into a [`Capability`].
///
/// The closure receives owned copies of the context and parameters so its
/// future can be `'static`.
pub struct FnCapability<F> {
    descriptor: CapabilityDescriptor,
    func: F,
}

impl<F, Fut> FnCapability<F>
where
    F: Fn(ExecutionContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CapError>> + Send + 'static,
{
    pub fn new(descriptor: CapabilityDescriptor, func: F) -> Self {
        Self { descriptor, func }
    }

    /// Shorthand for `Arc::new(FnCapability::new(..))`.
    pub fn shared(descriptor: CapabilityDescriptor, func: F) -> Arc<dyn Capability> {
        Arc::new(Self::new(descriptor, func))
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(ExecutionContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CapError>> + Send + 'static,
{
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<Value, CapError> {
        (self.func)(ctx.clone(), params.clone()).await
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Timeout harness
// ────────────────────────────────────────────────────────────────────────────

/// Run the body under its effective timeout, racing cancellation.
///
/// * elapsed budget → [`CapError::Timeout`] (distinct from other failures)
/// * cancel flag raised → [`CapError::ExecutionFailed`] `"execution cancelled"`
/// * panic in the body → [`CapError::ExecutionFailed`] with the panic text
///
/// The effective timeout is the context override when positive, otherwise
/// the descriptor's own timeout.
pub async fn execute_with_timeout(
    capability: &dyn Capability,
    ctx: &ExecutionContext,
    params: &Params,
) -> Result<Value, CapError> {
    let budget = ctx.effective_timeout(capability.descriptor().timeout());
    let body = AssertUnwindSafe(capability.execute(ctx, params)).catch_unwind();

    tokio::select! {
        biased;
        _ = ctx.cancel_flag().cancelled() => {
            Err(CapError::ExecutionFailed("execution cancelled".to_string()))
        }
        outcome = tokio::time::timeout(budget, body) => match outcome {
            Err(_elapsed) => Err(CapError::Timeout {
                seconds: budget.as_secs_f64(),
            }),
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(capability = capability.name(), %reason, "capability body panicked");
                Err(CapError::ExecutionFailed(format!("panic: {reason}")))
            }
            Ok(Ok(result)) => result,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_types::{ParameterSchema, ParameterType, PermissionLevel};
    use serde_json::json;
    use std::time::Duration;

    fn sleeper(timeout: Duration) -> Arc<dyn Capability> {
        let descriptor = CapabilityDescriptor::builder("sleep")
            .timeout(timeout)
            .parameter(ParameterSchema::optional(
                "ms",
                ParameterType::Integer,
                "sleep duration",
                json!(0),
            ))
            .build()
            .unwrap();
        FnCapability::shared(descriptor, |_ctx, params| async move {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!("woke"))
        })
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("tester", PermissionLevel::User)
    }

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn finishes_within_budget() {
        let cap = sleeper(Duration::from_secs(1));
        let out = execute_with_timeout(cap.as_ref(), &ctx(), &params(json!({"ms": 5}))).await;
        assert_eq!(out, Ok(json!("woke")));
    }

    #[tokio::test]
    async fn exceeding_budget_is_a_timeout() {
        let cap = sleeper(Duration::from_millis(20));
        let out = execute_with_timeout(cap.as_ref(), &ctx(), &params(json!({"ms": 500}))).await;
        assert!(matches!(out, Err(CapError::Timeout { .. })));
    }

    #[tokio::test]
    async fn context_override_beats_descriptor_timeout() {
        let cap = sleeper(Duration::from_secs(10));
        let ctx = ctx().with_timeout_override(Duration::from_millis(20));
        let out = execute_with_timeout(cap.as_ref(), &ctx, &params(json!({"ms": 500}))).await;
        assert!(matches!(out, Err(CapError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cancellation_wins_the_race() {
        let cap = sleeper(Duration::from_secs(10));
        let ctx = ctx();
        let flag = ctx.cancel_flag().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.cancel();
        });
        let out = execute_with_timeout(cap.as_ref(), &ctx, &params(json!({"ms": 2000}))).await;
        assert_eq!(out, Err(CapError::ExecutionFailed("execution cancelled".into())));
    }

    #[tokio::test]
    async fn panics_become_execution_failures() {
        let descriptor = CapabilityDescriptor::builder("boom").build().unwrap();
        let cap = FnCapability::new(descriptor, |_ctx, _params| async move {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let out = execute_with_timeout(&cap, &ctx(), &Params::new()).await;
        assert_eq!(out, Err(CapError::ExecutionFailed("panic: kaboom".into())));
    }

    #[test]
    fn default_validate_reports_missing_and_unknown() {
        let descriptor = CapabilityDescriptor::builder("echo")
            .parameter(ParameterSchema::required("message", ParameterType::String, "text"))
            .build()
            .unwrap();
        let cap = FnCapability::new(descriptor, |_ctx, _p| async move { Ok(Value::Null) });

        let errors = cap.validate(&params(json!({"extra": 1})));
        assert_eq!(errors["message"], vec!["required".to_string()]);
        assert_eq!(errors["extra"], vec!["unknown parameter".to_string()]);
        assert!(cap.validate(&params(json!({"message": "hi"}))).is_empty());
    }

    #[test]
    fn default_apply_defaults_delegates_to_descriptor() {
        let cap = sleeper(Duration::from_secs(1));
        let filled = cap.apply_defaults(&Params::new());
        assert_eq!(filled.get("ms"), Some(&json!(0)));
    }
}
