//! [`Engine`] – the composition root.
//!
//! Builds one [`CapabilityRegistry`] (with its [`Executor`] and audit log)
//! from an [`EngineConfig`] and exposes the request/response surface in
//! [`crate::api`].  There is no global instance; construct one at start-up
//! and pass it where it is needed.

use std::sync::Arc;

use capstan_kernel::{
    CancelFlag, CapabilityRegistry, DEFAULT_AUDIT_CAPACITY, EnvelopeStream, ExecutionContext,
    Executor, ListFilter, ProcfsProbe, ResourceLimits, ResourceProbe,
};
use capstan_types::{CapabilityDescriptor, RiskSeverity, ValidationLevel};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{CallerIdentity, ExecutionRequest, ExecutionResponse, ListQuery};

/// Engine-wide settings.  Every field has a default, so a partial TOML
/// table deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default validation level; callers may override per call.
    pub validation_level: ValidationLevel,
    /// Audit records retained in memory.
    pub audit_capacity: usize,
    /// Refuse execution above this used-memory percentage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_percent: Option<f64>,
    /// Refuse execution above this used-disk percentage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_disk_percent: Option<f64>,
    /// Refuse calls carrying a risk at or above this severity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_risk_at: Option<RiskSeverity>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            validation_level: ValidationLevel::default(),
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            max_memory_percent: None,
            max_disk_percent: None,
            block_risk_at: None,
        }
    }
}

impl EngineConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_memory_percent: self.max_memory_percent,
            max_disk_percent: self.max_disk_percent,
        }
    }
}

/// Registry plus request handling.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
}

impl Engine {
    /// An engine sampling host memory from `/proc/meminfo`.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcfsProbe::new()))
    }

    pub fn with_probe(config: EngineConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        let executor = Arc::new(Executor::new(config.limits(), probe));
        let registry = CapabilityRegistry::new()
            .with_executor(executor)
            .with_audit_capacity(config.audit_capacity)
            .with_validation_level(config.validation_level)
            .with_risk_threshold(config.block_risk_at);
        info!(
            level = %config.validation_level,
            audit_capacity = config.audit_capacity,
            max_memory_percent = ?config.max_memory_percent,
            "engine initialised"
        );
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Build the per-call context for `request` on behalf of `caller`.
    pub fn context_for(
        &self,
        caller: &CallerIdentity,
        request: &ExecutionRequest,
    ) -> Result<ExecutionContext, ExecutionResponse> {
        let mut ctx = ExecutionContext::new(caller.caller_id.clone(), caller.permission)
            .with_dry_run(request.dry_run);
        if let Some(session) = &caller.session_id {
            ctx = ctx.with_session(session.clone());
        }
        if let Some(id) = request.request_id {
            ctx = ctx.with_request_id(id);
        }
        match request.timeout_override() {
            Ok(Some(t)) => ctx = ctx.with_timeout_override(t),
            Ok(None) => {}
            Err(e) => return Err(ExecutionResponse::malformed(&e)),
        }
        Ok(ctx)
    }

    /// Execute `request` and map every outcome onto a response.
    pub async fn handle(&self, caller: &CallerIdentity, request: ExecutionRequest) -> ExecutionResponse {
        let ctx = match self.context_for(caller, &request) {
            Ok(ctx) => ctx,
            Err(response) => return response,
        };
        self.handle_with(&ctx, &request).await
    }

    /// Execute `request` under a caller-built context.
    pub async fn handle_with(&self, ctx: &ExecutionContext, request: &ExecutionRequest) -> ExecutionResponse {
        match self
            .registry
            .execute(&request.capability_name, ctx, &request.parameters)
            .await
        {
            Ok(result) => result.into(),
            Err(err) => {
                warn!(capability = %request.capability_name, error = %err, "request rejected");
                ExecutionResponse::from_error(&err)
            }
        }
    }

    /// Streaming variant of [`handle`](Self::handle).  Gate failures come
    /// back as an error response before any envelope is produced.
    pub async fn handle_streaming(
        &self,
        caller: &CallerIdentity,
        request: ExecutionRequest,
        cancel: Option<CancelFlag>,
    ) -> Result<EnvelopeStream, ExecutionResponse> {
        let mut ctx = self.context_for(caller, &request)?;
        if let Some(cancel) = cancel {
            ctx = ctx.with_cancel_flag(cancel);
        }
        self.registry
            .execute_streaming(&request.capability_name, &ctx, &request.parameters)
            .await
            .map_err(|err| {
                warn!(capability = %request.capability_name, error = %err, "stream rejected");
                ExecutionResponse::from_error(&err)
            })
    }

    /// Descriptors matching `query` that `caller` may execute.
    pub fn list(&self, caller: &CallerIdentity, query: &ListQuery) -> Vec<CapabilityDescriptor> {
        self.registry.list(&ListFilter {
            category: query.category.clone(),
            tag: query.tag.clone(),
            required_permission: query.required_permission,
            caller: Some(caller.permission),
        })
    }

    pub fn search(&self, caller: &CallerIdentity, query: &str) -> Vec<CapabilityDescriptor> {
        self.registry.search(query, Some(caller.permission))
    }

    pub fn set_validation_level(&self, level: ValidationLevel) {
        self.registry.set_validation_level(level);
    }
}
