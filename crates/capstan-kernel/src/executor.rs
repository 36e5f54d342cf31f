//! [`Executor`] – runs one validated call and accounts for it.
//!
//! ```text
//! dry run? ──yes──► simulated payload (not counted)
//!    │ no
//!    ▼
//! resource pre-flight ──over limit──► resourceExhausted
//!    │
//!    ▼
//! body under timeout ⟂ cancel ──► success | timeout | executionFailed
//!    │
//!    ▼
//! stats += exactly one outcome
//! ```
//!
//! Failure text returned to callers is always the class-level message from
//! [`CapError::public_message`]; the underlying detail is logged only.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use capstan_types::{CapError, ExecutionResult, FailureKind, Params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::capability::{Capability, execute_with_timeout};
use crate::context::ExecutionContext;
use crate::redaction::redact;
use crate::resource::{ResourceLimits, ResourceProbe, StaticProbe};

/// Aggregate counters.  `successful + failed + timed_out +
/// resource_exhausted == total` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub resource_exhausted: u64,
    pub total_elapsed_seconds: f64,
    pub average_elapsed_seconds: f64,
}

impl ExecutionStats {
    fn record(&mut self, kind: Option<FailureKind>, elapsed: Duration) {
        self.total += 1;
        match kind {
            None => self.successful += 1,
            Some(FailureKind::Timeout) => self.timed_out += 1,
            Some(FailureKind::ResourceExhausted) => self.resource_exhausted += 1,
            Some(_) => self.failed += 1,
        }
        self.total_elapsed_seconds += elapsed.as_secs_f64();
        self.average_elapsed_seconds = self.total_elapsed_seconds / self.total as f64;
    }

    /// Success rate in `[0, 1]`, or `None` before the first execution.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.successful as f64 / self.total as f64)
    }
}

/// Execution engine shared by every call through a registry.
pub struct Executor {
    limits: ResourceLimits,
    probe: Arc<dyn ResourceProbe>,
    stats: Mutex<ExecutionStats>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(ResourceLimits::unbounded(), Arc::new(StaticProbe::default()))
    }
}

impl Executor {
    pub fn new(limits: ResourceLimits, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            limits,
            probe,
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Sample the probe and compare against the limits.
    pub async fn preflight(&self) -> Result<(), CapError> {
        if self.limits.is_unbounded() {
            return Ok(());
        }
        let snapshot = self.probe.sample().await;
        debug!(probe = self.probe.name(), ?snapshot, "resource pre-flight");
        self.limits.check(&snapshot)
    }

    /// Run `capability` with `params` under `ctx`.
    ///
    /// Never returns an error: every failure is folded into the result.
    pub async fn execute(
        &self,
        capability: &dyn Capability,
        ctx: &ExecutionContext,
        params: &Params,
    ) -> ExecutionResult {
        let name = capability.name().to_string();
        let started = Instant::now();

        if ctx.dry_run {
            return self
                .simulate(capability, ctx, params)
                .with_elapsed(started.elapsed())
                .with_metadata("capability", json!(name))
                .with_metadata("requestId", json!(ctx.request_id))
                .with_metadata("dryRun", json!(true));
        }

        let enriched = ctx.enriched(&name);
        let outcome = match self.preflight().await {
            Ok(()) => execute_with_timeout(capability, &enriched, params).await,
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(payload) => {
                self.record(None, elapsed);
                debug!(capability = %name, elapsed_ms = elapsed.as_millis() as u64, "capability succeeded");
                ExecutionResult::success(payload)
            }
            Err(err) => {
                let kind = classify(&err);
                self.record(Some(kind), elapsed);
                let message = match kind {
                    FailureKind::Timeout => {
                        warn!(capability = %name, error = %err, "capability timed out");
                        err.public_message()
                    }
                    FailureKind::ResourceExhausted => {
                        warn!(capability = %name, error = %err, "capability refused by pre-flight");
                        err.public_message()
                    }
                    _ if ctx.is_cancelled() => {
                        debug!(capability = %name, "capability cancelled");
                        "Capability execution cancelled".to_string()
                    }
                    _ => {
                        error!(capability = %name, error = %err, "capability execution failed");
                        CapError::ExecutionFailed(String::new()).public_message()
                    }
                };
                ExecutionResult::failure(kind, message)
                    .with_metadata("errorKind", json!(kind))
            }
        };

        result
            .with_elapsed(elapsed)
            .with_metadata("capability", json!(name))
            .with_metadata("requestId", json!(ctx.request_id))
    }

    /// Validate and describe what would run, without running it.
    fn simulate(
        &self,
        capability: &dyn Capability,
        ctx: &ExecutionContext,
        params: &Params,
    ) -> ExecutionResult {
        let errors = capability.validate(params);
        if !errors.is_empty() {
            return ExecutionResult::failure(
                FailureKind::ValidationFailed,
                format!(
                    "Parameter validation failed: {}",
                    errors
                        .iter()
                        .map(|(f, m)| format!("{f}: {}", m.join(", ")))
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
            );
        }
        let timeout = ctx.effective_timeout(capability.descriptor().timeout());
        ExecutionResult::success(json!({
            "dryRun": true,
            "wouldExecute": capability.name(),
            "parameters": Value::Object(redact(params)),
            "timeoutSeconds": timeout.as_secs_f64(),
        }))
    }

    pub fn stats(&self) -> ExecutionStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = ExecutionStats::default();
    }

    fn record(&self, kind: Option<FailureKind>, elapsed: Duration) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(kind, elapsed);
    }
}

fn classify(err: &CapError) -> FailureKind {
    match err {
        CapError::Timeout { .. } => FailureKind::Timeout,
        CapError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
        _ => FailureKind::ExecutionFailed,
    }
}
