//! [`CapabilityRegistry`] – the authoritative index and single entry point
//! for executing capabilities.
//!
//! Every call runs the same gate sequence; the first failing stage
//! short-circuits with a typed [`CapError`]:
//!
//! ```text
//! lookup ──► permission ──► validation ──► audit (admin tier) ──► Executor
//!   │            │               │
//! NotFound  PermissionDenied  ValidationFailed (redacted snapshots)
//! ```
//!
//! Failures inside the capability body never surface as errors here; the
//! [`Executor`] folds them into a failed [`ExecutionResult`].
//!
//! The primary map and both secondary indexes live behind one `RwLock`, so
//! readers always observe a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use capstan_types::{
    AuditEvent, CapError, CapabilityDescriptor, ExecutionResult, Params, Permission,
    PermissionLevel, RiskSeverity, ValidationFailure, ValidationLevel, ValidationOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::capability::Capability;
use crate::context::ExecutionContext;
use crate::executor::Executor;
use crate::redaction::redact;
use crate::streaming::{EnvelopeStream, spawn_streaming};
use crate::validator::Validator;

// ────────────────────────────────────────────────────────────────────────────
// Query types
// ────────────────────────────────────────────────────────────────────────────

/// Filters for [`CapabilityRegistry::list`].  Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    pub category: Option<String>,
    pub tag: Option<String>,
    pub required_permission: Option<Permission>,
    /// Restrict to capabilities this tier may execute.
    pub caller: Option<PermissionLevel>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn required_permission(mut self, permission: Permission) -> Self {
        self.required_permission = Some(permission);
        self
    }

    pub fn caller(mut self, caller: PermissionLevel) -> Self {
        self.caller = Some(caller);
        self
    }
}

/// Registry-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub categories: usize,
    pub tags: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_permission: BTreeMap<String, usize>,
    pub streaming: usize,
}

/// Outcome of [`CapabilityRegistry::validate_parameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub capability: String,
    pub level: ValidationLevel,
    /// Converted parameters are redacted.
    pub outcome: ValidationOutcome,
}

/// Permission-filtered export of every visible descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub total: usize,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub capabilities: Vec<CapabilityDescriptor>,
}

// ────────────────────────────────────────────────────────────────────────────
// CapabilityRegistry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Index {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    categories: BTreeMap<String, BTreeSet<String>>,
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl Index {
    fn insert(&mut self, capability: Arc<dyn Capability>) {
        let d = capability.descriptor();
        let name = d.name.clone();
        self.categories
            .entry(d.category.clone())
            .or_default()
            .insert(name.clone());
        for tag in &d.tags {
            self.tags.entry(tag.clone()).or_default().insert(name.clone());
        }
        self.capabilities.insert(name, capability);
    }

    fn remove(&mut self, name: &str) -> bool {
        let Some(capability) = self.capabilities.remove(name) else {
            return false;
        };
        let d = capability.descriptor();
        detach(&mut self.categories, &d.category, name);
        for tag in &d.tags {
            detach(&mut self.tags, tag, name);
        }
        true
    }

    fn descriptors<'a>(
        &'a self,
        names: impl Iterator<Item = &'a String>,
    ) -> impl Iterator<Item = &'a CapabilityDescriptor> {
        names.filter_map(|n| self.capabilities.get(n).map(|c| c.descriptor()))
    }
}

fn detach(index: &mut BTreeMap<String, BTreeSet<String>>, key: &str, name: &str) {
    if let Some(names) = index.get_mut(key) {
        names.remove(name);
        if names.is_empty() {
            index.remove(key);
        }
    }
}

fn visible(descriptor: &CapabilityDescriptor, caller: Option<PermissionLevel>) -> bool {
    caller.is_none_or(|tier| tier.reaches(descriptor.required_permission))
}

struct Admitted {
    capability: Arc<dyn Capability>,
    outcome: ValidationOutcome,
}

/// Thread-safe capability index and execution gate.
///
/// # Example
///
/// ```
/// use capstan_kernel::{CapabilityRegistry, ExecutionContext, FnCapability};
/// use capstan_types::{CapabilityDescriptor, ParameterSchema, ParameterType, PermissionLevel};
/// use serde_json::json;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let registry = CapabilityRegistry::new();
/// let echo = CapabilityDescriptor::builder("echo")
///     .parameter(ParameterSchema::required("msg", ParameterType::String, "text"))
///     .build()
///     .unwrap();
/// registry
///     .register(FnCapability::shared(echo, |_ctx, p| async move { Ok(p["msg"].clone()) }))
///     .unwrap();
///
/// let ctx = ExecutionContext::new("guest-1", PermissionLevel::Guest);
/// let params = json!({"msg": "hi"}).as_object().cloned().unwrap();
/// let result = registry.execute("echo", &ctx, &params).await.unwrap();
/// assert_eq!(result.payload(), Some(&json!("hi")));
/// # });
/// ```
pub struct CapabilityRegistry {
    index: RwLock<Index>,
    level: RwLock<ValidationLevel>,
    validator: Validator,
    executor: Arc<Executor>,
    audit: AuditLog,
    block_risk_at: Option<RiskSeverity>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    /// An empty registry with built-in risk rules, an unbounded executor,
    /// and the default audit capacity.
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            level: RwLock::new(ValidationLevel::default()),
            validator: Validator::with_builtin_rules(),
            executor: Arc::new(Executor::default()),
            audit: AuditLog::default(),
            block_risk_at: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit = AuditLog::new(capacity);
        self
    }

    pub fn with_validation_level(self, level: ValidationLevel) -> Self {
        self.set_validation_level(level);
        self
    }

    /// Refuse calls carrying a risk at or above `threshold`.
    pub fn with_risk_threshold(mut self, threshold: Option<RiskSeverity>) -> Self {
        self.block_risk_at = threshold;
        self
    }

    // ── registration ───────────────────────────────────────────────────────

    /// Add `capability` to the index.
    ///
    /// # Errors
    ///
    /// * [`CapError::InvalidSchema`] – the descriptor or a pattern is malformed.
    /// * [`CapError::AlreadyRegistered`] – the name is taken; the registry
    ///   is left unchanged.
    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<(), CapError> {
        let descriptor = capability.descriptor();
        descriptor.check()?;
        self.validator.check_patterns(descriptor)?;

        let name = descriptor.name.clone();
        let mut index = self.write();
        if index.capabilities.contains_key(&name) {
            warn!(capability = %name, "duplicate registration rejected");
            return Err(CapError::AlreadyRegistered(name));
        }
        info!(
            capability = %name,
            category = %descriptor.category,
            permission = %descriptor.required_permission,
            streaming = descriptor.streaming,
            "capability registered"
        );
        index.insert(capability);
        Ok(())
    }

    /// Remove `name` from every index.  Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.write().remove(name);
        if removed {
            info!(capability = %name, "capability unregistered");
        }
        removed
    }

    // ── lookup ─────────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.read().capabilities.get(name).cloned()
    }

    /// The descriptor of `name`, if registered.
    pub fn info(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.read()
            .capabilities
            .get(name)
            .map(|c| c.descriptor().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().capabilities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().capabilities.is_empty()
    }

    /// Descriptors matching every set field of `filter`, sorted by name.
    pub fn list(&self, filter: &ListFilter) -> Vec<CapabilityDescriptor> {
        let index = self.read();

        let mut names: BTreeSet<String> = match &filter.category {
            Some(c) => index.categories.get(c).cloned().unwrap_or_default(),
            None => index.capabilities.keys().cloned().collect(),
        };
        if let Some(tag) = &filter.tag {
            let tagged = index.tags.get(tag).cloned().unwrap_or_default();
            names = names.intersection(&tagged).cloned().collect();
        }

        index
            .descriptors(names.iter())
            .filter(|d| {
                filter
                    .required_permission
                    .is_none_or(|p| d.required_permission == p)
            })
            .filter(|d| visible(d, filter.caller))
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over name, description, category,
    /// and tags.  Sorted by name.
    pub fn search(&self, query: &str, caller: Option<PermissionLevel>) -> Vec<CapabilityDescriptor> {
        let needle = query.to_lowercase();
        let index = self.read();
        let mut hits: Vec<CapabilityDescriptor> = index
            .capabilities
            .values()
            .map(|c| c.descriptor())
            .filter(|d| visible(d, caller))
            .filter(|d| {
                d.name.to_lowercase().contains(&needle)
                    || d.description.to_lowercase().contains(&needle)
                    || d.category.to_lowercase().contains(&needle)
                    || d.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name));
        hits
    }

    pub fn categories(&self) -> Vec<String> {
        self.read().categories.keys().cloned().collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.read().tags.keys().cloned().collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<CapabilityDescriptor> {
        self.list(&ListFilter::new().category(category))
    }

    pub fn by_tag(&self, tag: &str) -> Vec<CapabilityDescriptor> {
        self.list(&ListFilter::new().tag(tag))
    }

    pub fn stats(&self) -> RegistryStats {
        let index = self.read();
        let mut by_permission = BTreeMap::new();
        let mut streaming = 0;
        for capability in index.capabilities.values() {
            let d = capability.descriptor();
            *by_permission
                .entry(d.required_permission.to_string())
                .or_insert(0) += 1;
            if d.streaming {
                streaming += 1;
            }
        }
        RegistryStats {
            total: index.capabilities.len(),
            categories: index.categories.len(),
            tags: index.tags.len(),
            by_category: index
                .categories
                .iter()
                .map(|(c, names)| (c.clone(), names.len()))
                .collect(),
            by_permission,
            streaming,
        }
    }

    /// Every descriptor `caller` may see, with the category and tag sets
    /// they span.
    pub fn catalog(&self, caller: Option<PermissionLevel>) -> Catalog {
        let capabilities = self.list(&ListFilter {
            caller,
            ..ListFilter::default()
        });
        let categories: BTreeSet<String> =
            capabilities.iter().map(|d| d.category.clone()).collect();
        let tags: BTreeSet<String> = capabilities
            .iter()
            .flat_map(|d| d.tags.iter().cloned())
            .collect();
        Catalog {
            total: capabilities.len(),
            categories: categories.into_iter().collect(),
            tags: tags.into_iter().collect(),
            capabilities,
        }
    }

    // ── validation ─────────────────────────────────────────────────────────

    pub fn validation_level(&self) -> ValidationLevel {
        *self.level.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_validation_level(&self, level: ValidationLevel) {
        *self.level.write().unwrap_or_else(PoisonError::into_inner) = level;
        info!(%level, "validation level changed");
    }

    /// Validate `params` for `name` without executing.
    ///
    /// # Errors
    ///
    /// [`CapError::NotFound`] for an unknown name.
    pub fn validate_parameters(
        &self,
        name: &str,
        params: &Params,
        level: Option<ValidationLevel>,
    ) -> Result<ValidationReport, CapError> {
        let capability = self
            .get(name)
            .ok_or_else(|| CapError::NotFound(name.to_string()))?;
        let level = level.unwrap_or_else(|| self.validation_level());
        let mut outcome = self
            .validator
            .validate(capability.descriptor(), params, level);
        outcome.converted = redact(&outcome.converted);
        Ok(ValidationReport {
            capability: name.to_string(),
            level,
            outcome,
        })
    }

    // ── execution ──────────────────────────────────────────────────────────

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Resolve, authorize, validate, audit, then execute `name`.
    ///
    /// # Errors
    ///
    /// [`CapError::NotFound`], [`CapError::PermissionDenied`], or
    /// [`CapError::ValidationFailed`].  Every later failure is returned as a
    /// failed [`ExecutionResult`].
    pub async fn execute(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        raw: &Params,
    ) -> Result<ExecutionResult, CapError> {
        let Admitted {
            capability,
            outcome,
        } = self.admit(name, ctx, raw)?;

        if capability.descriptor().required_permission.is_highest_tier() {
            let event = if ctx.dry_run {
                AuditEvent::AdminDryRun
            } else {
                AuditEvent::AdminExecution
            };
            self.audit.record_execution(name, ctx, raw, event);
        }

        let result = self
            .executor
            .execute(capability.as_ref(), ctx, &outcome.converted)
            .await;
        Ok(annotate(result, &outcome))
    }

    /// Like [`execute`](Self::execute) but returns an envelope stream.
    ///
    /// Non-streaming capabilities yield a single final envelope.  Must be
    /// awaited within a Tokio runtime.
    pub async fn execute_streaming(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        raw: &Params,
    ) -> Result<EnvelopeStream, CapError> {
        let Admitted {
            capability,
            outcome,
        } = self.admit(name, ctx, raw)?;

        if capability.descriptor().required_permission.is_highest_tier() {
            let event = if ctx.dry_run {
                AuditEvent::AdminDryRun
            } else {
                AuditEvent::AdminStreamingExecution
            };
            self.audit.record_execution(name, ctx, raw, event);
        }

        Ok(spawn_streaming(
            Arc::clone(&self.executor),
            capability,
            ctx.clone(),
            outcome.converted,
        ))
    }

    fn admit(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        raw: &Params,
    ) -> Result<Admitted, CapError> {
        info!(
            capability = %name,
            caller = %ctx.caller_id,
            permission = %ctx.permission,
            request_id = %ctx.request_id,
            dry_run = ctx.dry_run,
            "execution requested"
        );

        let capability = self
            .get(name)
            .ok_or_else(|| CapError::NotFound(name.to_string()))?;
        let descriptor = capability.descriptor();

        if !ctx.permission.reaches(descriptor.required_permission) {
            warn!(
                capability = %name,
                caller = %ctx.caller_id,
                required = %descriptor.required_permission,
                permission = %ctx.permission,
                "permission denied"
            );
            return Err(CapError::PermissionDenied {
                capability: name.to_string(),
                required: descriptor.required_permission,
                caller: ctx.permission,
            });
        }

        let level = ctx
            .validation_level
            .unwrap_or_else(|| self.validation_level());
        let mut outcome = self.validator.validate(descriptor, raw, level);

        if let Some(threshold) = self.block_risk_at {
            let blocked: Vec<_> = outcome
                .security_risks
                .iter()
                .filter(|r| r.severity >= threshold)
                .map(|r| (r.field.clone(), format!("blocked: {} risk ({})", r.rule, r.severity)))
                .collect();
            for (field, message) in blocked {
                outcome.add_error(&field, message);
            }
            outcome.valid = outcome.errors.is_empty();
        }

        if !outcome.valid {
            debug!(capability = %name, errors = %outcome.error_summary(), "validation failed");
            return Err(CapError::ValidationFailed(Box::new(ValidationFailure {
                capability: name.to_string(),
                errors: outcome.errors,
                warnings: outcome.warnings,
                security_risks: outcome.security_risks,
                provided_parameters: redact(raw),
                converted_parameters: redact(&outcome.converted),
            })));
        }

        if let Some(severity) = outcome.max_risk() {
            let rules: Vec<&str> = outcome.security_risks.iter().map(|r| r.rule.as_str()).collect();
            warn!(capability = %name, %severity, ?rules, "risk indicators in accepted parameters");
        }

        Ok(Admitted {
            capability,
            outcome,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Attach validation findings to the result's metadata.
fn annotate(mut result: ExecutionResult, outcome: &ValidationOutcome) -> ExecutionResult {
    if !outcome.security_risks.is_empty() {
        result
            .metadata_mut()
            .insert("securityRisks".into(), json!(outcome.security_risks));
    }
    if !outcome.warnings.is_empty() {
        result
            .metadata_mut()
            .insert("validationWarnings".into(), json!(outcome.warnings));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FnCapability;
    use capstan_types::{FailureKind, ParameterSchema, ParameterType, StreamPhase};
    use futures_util::StreamExt;
    use serde_json::Value;
    use std::time::Duration;

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    fn echo() -> Arc<dyn Capability> {
        let d = CapabilityDescriptor::builder("echo")
            .description("Repeat a message")
            .category("utility")
            .tags(["text", "demo"])
            .permission(Permission::Read)
            .parameter(ParameterSchema::required("msg", ParameterType::String, "text"))
            .build()
            .unwrap();
        FnCapability::shared(d, |_ctx, p| async move { Ok(p["msg"].clone()) })
    }

    fn cap(name: &str, category: &str, tag: &str, permission: Permission) -> Arc<dyn Capability> {
        let d = CapabilityDescriptor::builder(name)
            .description(format!("{name} capability"))
            .category(category)
            .tag(tag)
            .permission(permission)
            .build()
            .unwrap();
        FnCapability::shared(d, |_ctx, _p| async move { Ok(json!("ok")) })
    }

    fn admin_cap() -> Arc<dyn Capability> {
        let d = CapabilityDescriptor::builder("rotate_keys")
            .category("security")
            .permission(Permission::Admin)
            .parameter(ParameterSchema::required("api_key", ParameterType::String, "key"))
            .build()
            .unwrap();
        FnCapability::shared(d, |_ctx, _p| async move { Ok(json!("rotated")) })
    }

    fn populated() -> CapabilityRegistry {
        let r = CapabilityRegistry::new();
        r.register(echo()).unwrap();
        r.register(cap("read_file", "files", "io", Permission::Read)).unwrap();
        r.register(cap("write_file", "files", "io", Permission::Write)).unwrap();
        r.register(cap("run_job", "jobs", "compute", Permission::Execute)).unwrap();
        r.register(admin_cap()).unwrap();
        r
    }

    fn as_tier(tier: PermissionLevel) -> ExecutionContext {
        ExecutionContext::new(format!("{tier}-caller"), tier)
    }

    #[tokio::test]
    async fn guest_can_echo() {
        let r = populated();
        let result = r
            .execute("echo", &as_tier(PermissionLevel::Guest), &params(json!({"msg": "hi"})))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.payload(), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let r = populated();
        let err = r
            .execute("ghost", &as_tier(PermissionLevel::Admin), &Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, CapError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn user_cannot_run_admin_capability() {
        let r = populated();
        let err = r
            .execute(
                "rotate_keys",
                &as_tier(PermissionLevel::User),
                &params(json!({"api_key": "k"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapError::PermissionDenied { required: Permission::Admin, caller: PermissionLevel::User, .. }
        ));
        assert!(r.audit_log().is_empty());
    }

    #[tokio::test]
    async fn missing_field_is_a_validation_failure() {
        let r = populated();
        let err = r
            .execute("echo", &as_tier(PermissionLevel::Guest), &Params::new())
            .await
            .unwrap_err();
        let CapError::ValidationFailed(failure) = err else {
            panic!("expected validation failure, got {err:?}");
        };
        assert_eq!(failure.errors["msg"], vec!["required"]);
    }

    #[tokio::test]
    async fn validation_failure_payload_is_redacted() {
        let r = populated();
        let err = r
            .execute(
                "rotate_keys",
                &as_tier(PermissionLevel::Admin),
                &params(json!({"api_key": "sk-live-123", "extra_token": "tok-9"})),
            )
            .await
            .unwrap_err();
        let text = serde_json::to_string(&err).unwrap();
        assert!(!text.contains("sk-live-123"));
        assert!(!text.contains("tok-9"));
        assert!(text.contains(crate::redaction::REDACTED));
    }

    #[test]
    fn duplicate_registration_leaves_registry_unchanged() {
        let r = CapabilityRegistry::new();
        r.register(echo()).unwrap();
        let err = r.register(echo()).unwrap_err();
        assert_eq!(err, CapError::AlreadyRegistered("echo".into()));
        assert_eq!(r.len(), 1);
        assert_eq!(r.by_category("utility").len(), 1);
    }

    #[test]
    fn invalid_patterns_are_rejected_at_registration() {
        let d = CapabilityDescriptor::builder("bad")
            .parameter(ParameterSchema::required("s", ParameterType::String, "s").with_pattern("[oops"))
            .build()
            .unwrap();
        let r = CapabilityRegistry::new();
        let err = r
            .register(FnCapability::shared(d, |_c, _p| async move { Ok(Value::Null) }))
            .unwrap_err();
        assert!(matches!(err, CapError::InvalidSchema { .. }));
        assert!(r.is_empty());
    }

    #[test]
    fn defaults_violating_their_constraints_are_rejected_at_registration() {
        let r = CapabilityRegistry::new();
        for parameter in [
            json!({"name": "mode", "type": "string", "required": false, "default": "bogus",
                   "choices": ["fast", "slow"]}),
            json!({"name": "n", "type": "integer", "required": false, "default": 500, "max": 100}),
            json!({"name": "id", "type": "string", "required": false, "default": "ABC",
                   "pattern": "[a-z]+"}),
        ] {
            let d: CapabilityDescriptor =
                serde_json::from_value(json!({"name": "defaults", "parameters": [parameter]})).unwrap();
            let err = r
                .register(FnCapability::shared(d, |_c, _p| async move { Ok(Value::Null) }))
                .unwrap_err();
            assert!(
                matches!(err, CapError::InvalidSchema { ref reason, .. } if reason.starts_with("default value")),
                "{err:?}"
            );
        }
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn timeouts_surface_as_results_and_count_once() {
        let d = CapabilityDescriptor::builder("nap")
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let r = CapabilityRegistry::new();
        r.register(FnCapability::shared(d, |_c, _p| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }))
        .unwrap();

        let result = r
            .execute("nap", &as_tier(PermissionLevel::Guest), &Params::new())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(r.executor().stats().timed_out, 1);
        assert_eq!(r.executor().stats().failed, 0);
    }

    #[test]
    fn unregister_clears_secondary_indexes() {
        let r = populated();
        assert!(r.unregister("run_job"));
        assert!(!r.unregister("run_job"));
        assert!(!r.categories().contains(&"jobs".to_string()));
        assert!(!r.tags().contains(&"compute".to_string()));
        assert!(r.get("run_job").is_none());
    }

    #[test]
    fn list_intersects_filters() {
        let r = populated();
        let names = |v: Vec<CapabilityDescriptor>| v.into_iter().map(|d| d.name).collect::<Vec<_>>();

        assert_eq!(
            names(r.list(&ListFilter::new().category("files"))),
            vec!["read_file", "write_file"]
        );
        assert_eq!(
            names(r.list(&ListFilter::new().category("files").required_permission(Permission::Write))),
            vec!["write_file"]
        );
        assert_eq!(
            names(r.list(&ListFilter::new().tag("io").caller(PermissionLevel::Guest))),
            vec!["read_file"]
        );
        assert!(r.list(&ListFilter::new().category("files").tag("demo")).is_empty());
        assert!(r.list(&ListFilter::new().category("nope")).is_empty());
    }

    #[test]
    fn listing_respects_permission_hierarchy() {
        let r = populated();
        let count = |tier| r.list(&ListFilter::new().caller(tier)).len();
        assert_eq!(count(PermissionLevel::Guest), 2);
        assert_eq!(count(PermissionLevel::User), 4);
        assert_eq!(count(PermissionLevel::Admin), 5);
    }

    #[test]
    fn search_matches_any_text_field() {
        let r = populated();
        let names = |q: &str, c| r.search(q, c).into_iter().map(|d| d.name).collect::<Vec<_>>();
        assert_eq!(names("ECHO", None), vec!["echo"]);
        assert_eq!(names("repeat", None), vec!["echo"]);
        assert_eq!(names("security", None), vec!["rotate_keys"]);
        assert_eq!(names("compute", None), vec!["run_job"]);
        assert!(names("security", Some(PermissionLevel::User)).is_empty());
    }

    #[test]
    fn stats_and_catalog_reflect_contents() {
        let r = populated();
        let stats = r.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_category["files"], 2);
        assert_eq!(stats.by_permission["read"], 2);
        assert_eq!(stats.by_permission["admin"], 1);

        let catalog = r.catalog(Some(PermissionLevel::Guest));
        assert_eq!(catalog.total, 2);
        assert_eq!(catalog.categories, vec!["files", "utility"]);
    }

    #[tokio::test]
    async fn admin_executions_are_audited_with_redaction() {
        let r = populated();
        let result = r
            .execute(
                "rotate_keys",
                &as_tier(PermissionLevel::Admin),
                &params(json!({"api_key": "sk-live-123"})),
            )
            .await
            .unwrap();
        assert!(result.is_success());

        let records = r.audit_log().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, AuditEvent::AdminExecution);
        assert_eq!(records[0].parameters["api_key"], json!(crate::redaction::REDACTED));

        // Non-admin capabilities are not audited.
        r.execute("echo", &as_tier(PermissionLevel::Admin), &params(json!({"msg": "x"})))
            .await
            .unwrap();
        assert_eq!(r.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn admin_dry_runs_are_audited_but_not_executed() {
        let r = populated();
        let ctx = as_tier(PermissionLevel::Admin).with_dry_run(true);
        let result = r
            .execute("rotate_keys", &ctx, &params(json!({"api_key": "k"})))
            .await
            .unwrap();
        assert_eq!(result.payload().unwrap()["wouldExecute"], json!("rotate_keys"));
        assert_eq!(r.audit_log().records()[0].event, AuditEvent::AdminDryRun);
        assert_eq!(r.executor().stats().total, 0);
    }

    #[tokio::test]
    async fn risks_are_attached_to_result_metadata() {
        let r = populated();
        let result = r
            .execute(
                "echo",
                &as_tier(PermissionLevel::Guest),
                &params(json!({"msg": "../../secret"})),
            )
            .await
            .unwrap();
        assert!(result.is_success());
        let risks = &result.metadata()["securityRisks"];
        assert_eq!(risks[0]["rule"], json!("path_traversal"));
    }

    #[tokio::test]
    async fn risk_threshold_blocks_execution() {
        let r = CapabilityRegistry::new().with_risk_threshold(Some(RiskSeverity::High));
        r.register(echo()).unwrap();
        let err = r
            .execute(
                "echo",
                &as_tier(PermissionLevel::Guest),
                &params(json!({"msg": "$(reboot)"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CapError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn per_call_level_overrides_default() {
        let r = populated();
        r.set_validation_level(ValidationLevel::Strict);
        assert_eq!(r.validation_level(), ValidationLevel::Strict);

        let d = CapabilityDescriptor::builder("count")
            .parameter(ParameterSchema::required("n", ParameterType::Integer, "n"))
            .build()
            .unwrap();
        r.register(FnCapability::shared(d, |_c, p| async move { Ok(p["n"].clone()) }))
            .unwrap();

        let raw = params(json!({"n": "7"}));
        let strict = r.execute("count", &as_tier(PermissionLevel::Guest), &raw).await;
        assert!(matches!(strict, Err(CapError::ValidationFailed(_))));

        let ctx = as_tier(PermissionLevel::Guest).with_validation_level(ValidationLevel::Standard);
        let lenient = r.execute("count", &ctx, &raw).await.unwrap();
        assert_eq!(lenient.payload(), Some(&json!(7)));
        assert!(lenient.metadata().contains_key("validationWarnings"));
    }

    #[test]
    fn validate_parameters_reports_without_executing() {
        let r = populated();
        let report = r
            .validate_parameters("rotate_keys", &params(json!({"api_key": "k"})), None)
            .unwrap();
        assert!(report.outcome.valid);
        assert_eq!(report.level, ValidationLevel::Standard);
        assert_eq!(report.outcome.converted["api_key"], json!(crate::redaction::REDACTED));
        assert_eq!(r.executor().stats().total, 0);

        assert!(matches!(
            r.validate_parameters("ghost", &Params::new(), None),
            Err(CapError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn streaming_capability_reports_progress() {
        let d = CapabilityDescriptor::builder("count_up")
            .streaming(true)
            .parameter(ParameterSchema::optional("steps", ParameterType::Integer, "n", json!(3)))
            .build()
            .unwrap();
        let r = CapabilityRegistry::new();
        r.register(FnCapability::shared(d, |ctx, p| async move {
            let steps = p["steps"].as_u64().unwrap_or(1);
            for i in 1..=steps {
                ctx.progress()
                    .report(i as f64 / steps as f64 * 0.9, format!("step {i}"), Some(json!(i)));
            }
            Ok(json!({"counted": steps}))
        }))
        .unwrap();

        let stream = r
            .execute_streaming("count_up", &as_tier(PermissionLevel::Guest), &Params::new())
            .await
            .unwrap();
        let envelopes: Vec<_> = stream.collect().await;

        assert_eq!(envelopes.len(), 4);
        let seqs: Vec<u64> = envelopes.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        let finals: Vec<_> = envelopes.iter().filter(|e| e.is_final).collect();
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].completion, 1.0);
        assert_eq!(finals[0].phase, StreamPhase::Completed);
        assert_eq!(finals[0].result.payload(), Some(&json!({"counted": 3})));

        // Through the plain contract only the net result comes back.
        let plain = r
            .execute("count_up", &as_tier(PermissionLevel::Guest), &Params::new())
            .await
            .unwrap();
        assert_eq!(plain.payload(), Some(&json!({"counted": 3})));
    }

    #[tokio::test]
    async fn non_streaming_capability_yields_one_final_envelope() {
        let r = populated();
        let stream = r
            .execute_streaming("echo", &as_tier(PermissionLevel::Guest), &params(json!({"msg": "hi"})))
            .await
            .unwrap();
        let envelopes: Vec<_> = stream.collect().await;
        assert_eq!(envelopes.len(), 1);
        assert!(envelopes[0].is_final);
        assert_eq!(envelopes[0].sequence, 1);
        assert_eq!(envelopes[0].result.payload(), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn streaming_timeout_ends_with_error_envelope() {
        let d = CapabilityDescriptor::builder("stall")
            .streaming(true)
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let r = CapabilityRegistry::new();
        r.register(FnCapability::shared(d, |ctx, _p| async move {
            ctx.progress().report(0.1, "started", None);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }))
        .unwrap();

        let envelopes: Vec<_> = r
            .execute_streaming("stall", &as_tier(PermissionLevel::Guest), &Params::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[1].phase, StreamPhase::Error);
        assert_eq!(envelopes[1].result.failure_kind(), Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn streaming_gates_run_before_spawning() {
        let r = populated();
        let denied = r
            .execute_streaming("rotate_keys", &as_tier(PermissionLevel::Guest), &Params::new())
            .await;
        assert!(matches!(denied, Err(CapError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn drained_stream_leaves_the_caller_flag_usable() {
        let r = populated();
        let ctx = as_tier(PermissionLevel::Guest);
        let envelopes: Vec<_> = r
            .execute_streaming("echo", &ctx, &params(json!({"msg": "first"})))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(envelopes.last().unwrap().is_final);
        assert!(!ctx.is_cancelled());

        let again = r.execute("echo", &ctx, &params(json!({"msg": "second"}))).await.unwrap();
        assert!(again.is_success());
        assert_eq!(again.payload(), Some(&json!("second")));
    }

    #[tokio::test]
    async fn cancelling_mid_stream_ends_with_one_error_envelope() {
        let d = CapabilityDescriptor::builder("ticker")
            .streaming(true)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        let r = CapabilityRegistry::new();
        r.register(FnCapability::shared(d, |ctx, _p| async move {
            ctx.progress().report(0.2, "tick 1", None);
            ctx.progress().report(0.4, "tick 2", None);
            tokio::time::sleep(Duration::from_secs(10)).await;
            ctx.progress().report(0.6, "tick 3", None);
            Ok(Value::Null)
        }))
        .unwrap();

        let ctx = as_tier(PermissionLevel::Guest);
        let mut stream = r.execute_streaming("ticker", &ctx, &Params::new()).await.unwrap();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.phase, StreamPhase::Processing);
        assert_eq!(second.phase, StreamPhase::Processing);

        ctx.cancel_flag().cancel();
        let last = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("cancel must end the stream promptly")
            .unwrap();
        assert!(stream.next().await.is_none());

        let seqs = [first.sequence, second.sequence, last.sequence];
        assert_eq!(seqs, [1, 2, 3]);
        assert!(!first.is_final && !second.is_final);
        assert!(last.is_final);
        assert_eq!(last.phase, StreamPhase::Error);
        assert!(!last.result.is_success());
    }

    #[test]
    fn permission_monotonicity_over_registered_capabilities() {
        let r = populated();
        for d in r.list(&ListFilter::new()) {
            for pair in PermissionLevel::ALL.windows(2) {
                if pair[0].reaches(d.required_permission) {
                    assert!(pair[1].reaches(d.required_permission), "{}", d.name);
                }
            }
        }
    }

    #[tokio::test]
    async fn concurrent_registration_keeps_indexes_consistent() {
        let r = Arc::new(CapabilityRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let r = Arc::clone(&r);
            tasks.push(tokio::spawn(async move {
                let name = format!("cap_{i}");
                r.register(cap(&name, "bulk", "t", Permission::Read)).unwrap();
                if i % 2 == 0 {
                    r.unregister(&name);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(r.len(), 16);
        assert_eq!(r.by_category("bulk").len(), 16);
        assert_eq!(r.by_tag("t").len(), 16);
        assert_eq!(r.stats().by_category["bulk"], 16);
    }
}
