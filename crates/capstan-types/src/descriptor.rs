//! Capability metadata: everything about a capability except its behavior.

use std::collections::BTreeSet;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::permission::Permission;
use crate::schema::ParameterSchema;
use crate::{CapError, Params};

/// Default timeout budget applied by [`DescriptorBuilder`] when none is set.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 30.0;

/// Metadata describing a registered capability.
///
/// Serializes to the registration surface consumed from capability
/// providers, and is the only view of a capability that listing and search
/// ever return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_permission")]
    pub required_permission: Permission,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub parameters: Vec<ParameterSchema>,
    /// `true` when the capability reports incremental progress.
    #[serde(default)]
    pub streaming: bool,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_permission() -> Permission {
    Permission::Read
}

fn default_timeout_seconds() -> f64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl CapabilityDescriptor {
    /// Start building a descriptor for `name`.
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            descriptor: CapabilityDescriptor {
                name: name.into(),
                description: String::new(),
                category: default_category(),
                tags: BTreeSet::new(),
                required_permission: default_permission(),
                timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
                parameters: Vec::new(),
                streaming: false,
            },
        }
    }

    /// The capability's own timeout budget.
    ///
    /// Falls back to [`DEFAULT_TIMEOUT_SECONDS`] for values a [`Duration`]
    /// cannot represent; [`check`](Self::check) rejects those at registration.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECONDS))
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSchema> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Return a copy of `params` with every absent or null non-required field
    /// set to its schema default.  Required fields are left untouched.
    ///
    /// Idempotent: applying it twice yields the same map.
    ///
    /// ```
    /// use capstan_types::{CapabilityDescriptor, ParameterSchema, ParameterType, Params};
    /// use serde_json::json;
    ///
    /// let desc = CapabilityDescriptor::builder("greet")
    ///     .parameter(ParameterSchema::required("name", ParameterType::String, "Who"))
    ///     .parameter(ParameterSchema::optional("punct", ParameterType::String, "End", json!("!")))
    ///     .build()
    ///     .unwrap();
    ///
    /// let params = desc.apply_defaults(&Params::new());
    /// assert_eq!(params.get("punct"), Some(&json!("!")));
    /// assert!(params.get("name").is_none());
    /// ```
    pub fn apply_defaults(&self, params: &Params) -> Params {
        let mut out = params.clone();
        for schema in self.parameters.iter().filter(|p| !p.required) {
            let missing = out.get(&schema.name).is_none_or(|v| v.is_null());
            if missing && let Some(default) = &schema.default {
                out.insert(schema.name.clone(), default.clone());
            }
        }
        out
    }

    /// Validate the descriptor's own invariants.
    ///
    /// # Errors
    ///
    /// [`CapError::InvalidSchema`] naming the offending parameter (or
    /// `"<descriptor>"` for capability-level defects).
    pub fn check(&self) -> Result<(), CapError> {
        let invalid = |parameter: &str, reason: String| CapError::InvalidSchema {
            capability: self.name.clone(),
            parameter: parameter.to_string(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("<descriptor>", "name must not be empty".into()));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(invalid(
                "<descriptor>",
                format!("timeout {} must be a positive number of seconds", self.timeout_seconds),
            ));
        }
        if Duration::try_from_secs_f64(self.timeout_seconds).is_err() {
            return Err(invalid("<descriptor>", "timeout is out of range".into()));
        }

        let mut seen = BTreeSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(invalid(&param.name, "duplicate parameter name".into()));
            }
            param.check().map_err(|reason| invalid(&param.name, reason))?;
        }
        Ok(())
    }
}

/// Builder returned by [`CapabilityDescriptor::builder`].
///
/// This is the explicit mapping step that turns a plain function's
/// parameter list into a schema, performed once at registration.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    descriptor: CapabilityDescriptor,
}

impl DescriptorBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.descriptor.category = category.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.descriptor.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.descriptor.required_permission = permission;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout_seconds = timeout.as_secs_f64();
        self
    }

    pub fn parameter(mut self, schema: ParameterSchema) -> Self {
        self.descriptor.parameters.push(schema);
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.descriptor.streaming = streaming;
        self
    }

    /// Finish and check the descriptor.
    ///
    /// # Errors
    ///
    /// [`CapError::InvalidSchema`] when [`CapabilityDescriptor::check`] fails.
    pub fn build(self) -> Result<CapabilityDescriptor, CapError> {
        self.descriptor.check()?;
        Ok(self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ParameterType;
    use serde_json::json;

    fn sample() -> CapabilityDescriptor {
        CapabilityDescriptor::builder("fetch")
            .description("Fetch a thing")
            .category("net")
            .tags(["http", "io"])
            .permission(Permission::Execute)
            .timeout(Duration::from_secs(5))
            .parameter(ParameterSchema::required("url", ParameterType::String, "Target"))
            .parameter(ParameterSchema::optional(
                "retries",
                ParameterType::Integer,
                "Retries",
                json!(2),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_sets_metadata() {
        let d = sample();
        assert_eq!(d.category, "net");
        assert!(d.tags.contains("http"));
        assert_eq!(d.required_permission, Permission::Execute);
        assert_eq!(d.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn apply_defaults_fills_only_optional_fields() {
        let d = sample();
        let out = d.apply_defaults(&Params::new());
        assert_eq!(out.get("retries"), Some(&json!(2)));
        assert!(!out.contains_key("url"));
    }

    #[test]
    fn apply_defaults_keeps_supplied_values() {
        let d = sample();
        let mut p = Params::new();
        p.insert("retries".into(), json!(7));
        assert_eq!(d.apply_defaults(&p).get("retries"), Some(&json!(7)));
    }

    #[test]
    fn apply_defaults_replaces_null() {
        let d = sample();
        let mut p = Params::new();
        p.insert("retries".into(), json!(null));
        assert_eq!(d.apply_defaults(&p).get("retries"), Some(&json!(2)));
    }

    #[test]
    fn apply_defaults_is_idempotent() {
        let d = sample();
        let mut p = Params::new();
        p.insert("url".into(), json!("http://x"));
        let once = d.apply_defaults(&p);
        assert_eq!(d.apply_defaults(&once), once);
    }

    #[test]
    fn duplicate_parameter_names_are_rejected() {
        let err = CapabilityDescriptor::builder("dup")
            .parameter(ParameterSchema::required("a", ParameterType::String, ""))
            .parameter(ParameterSchema::required("a", ParameterType::Integer, ""))
            .build()
            .unwrap_err();
        assert!(matches!(err, CapError::InvalidSchema { ref parameter, .. } if parameter == "a"));
    }

    #[test]
    fn non_positive_timeout_is_rejected() {
        let mut d = sample();
        d.timeout_seconds = 0.0;
        assert!(d.check().is_err());
        d.timeout_seconds = f64::NAN;
        assert!(d.check().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let d: CapabilityDescriptor = serde_json::from_value(json!({
            "name": "echo",
            "requiredPermission": "read",
            "timeoutSeconds": 2,
            "parameters": [{"name": "msg", "type": "string", "required": true}]
        }))
        .unwrap();
        assert_eq!(d.category, "general");
        assert_eq!(d.timeout(), Duration::from_secs(2));
        assert!(d.check().is_ok());
    }
}
