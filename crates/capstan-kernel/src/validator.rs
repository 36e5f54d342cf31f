//! [`Validator`] – parameter checking, coercion, and risk scanning.
//!
//! Validation runs per field, in schema order:
//!
//! 1. Fields not declared by the schema → `"unknown parameter"`.
//! 2. Absent (or `null`) required field → `"required"`; absent optional
//!    field → its default.
//! 3. Type check, coercing where unambiguous (below).
//! 4. Constraints: numeric range, length, choices, anchored pattern.
//!
//! | Level      | Coercion                           | Risk scan |
//! |------------|------------------------------------|-----------|
//! | `Basic`    | string ↔ scalar, integral float    | no        |
//! | `Standard` | as `Basic`                         | yes       |
//! | `Strict`   | integer → float widening only      | yes       |
//!
//! Risk scanning inspects every accepted string (recursively inside arrays
//! and objects) with each registered [`RiskRule`].  Findings never affect
//! `valid`; callers decide what to do with them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use capstan_types::{
    CapError, CapabilityDescriptor, ParameterSchema, ParameterType, Params, RiskSeverity,
    SecurityRisk, ValidationLevel, ValidationOutcome,
};
use regex::Regex;
use serde_json::{Number, Value};

// ────────────────────────────────────────────────────────────────────────────
// RiskRule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single risk indicator applied to string values.
///
/// Add custom rules with [`Validator::add_rule`].
pub trait RiskRule: Send + Sync {
    /// Stable identifier recorded in [`SecurityRisk::rule`].
    fn name(&self) -> &str;

    /// Severity when `value` exhibits the indicator, `None` otherwise.
    fn scan(&self, value: &str) -> Option<RiskSeverity>;
}

// ────────────────────────────────────────────────────────────────────────────
// Validator
// ────────────────────────────────────────────────────────────────────────────

/// Schema checker with a pluggable set of risk rules.
///
/// Patterns are compiled once, when [`check_patterns`](Validator::check_patterns)
/// first sees them, and reused for every later call.
///
/// # Example
///
/// ```
/// use capstan_kernel::Validator;
/// use capstan_types::{CapabilityDescriptor, ParameterSchema, ParameterType, ValidationLevel};
/// use serde_json::json;
///
/// let desc = CapabilityDescriptor::builder("read_file")
///     .parameter(ParameterSchema::required("path", ParameterType::String, "file"))
///     .build()
///     .unwrap();
/// let validator = Validator::with_builtin_rules();
///
/// let params = json!({"path": "../../etc/passwd"}).as_object().cloned().unwrap();
/// let outcome = validator.validate(&desc, &params, ValidationLevel::Standard);
/// assert!(outcome.valid);
/// assert_eq!(outcome.security_risks[0].rule, "path_traversal");
/// ```
#[derive(Default)]
pub struct Validator {
    rules: Vec<Box<dyn RiskRule>>,
    patterns: RwLock<HashMap<String, Regex>>,
}

impl Validator {
    /// A validator with no risk rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// A validator preloaded with every built-in risk rule.
    pub fn with_builtin_rules() -> Self {
        let mut v = Self::new();
        v.add_rule(Box::new(PathTraversalRule));
        v.add_rule(Box::new(NullByteRule));
        v.add_rule(Box::new(CommandInjectionRule));
        v.add_rule(Box::new(SqlInjectionRule));
        v.add_rule(Box::new(ScriptInjectionRule));
        v.add_rule(Box::new(SystemPathRule));
        v
    }

    /// Register a [`RiskRule`].  Rules run in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn RiskRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Compile every pattern in `descriptor` into the cache and check
    /// string defaults against them.
    ///
    /// # Errors
    ///
    /// [`CapError::InvalidSchema`] for the first pattern that does not
    /// compile or is not matched by its field's default.
    pub fn check_patterns(&self, descriptor: &CapabilityDescriptor) -> Result<(), CapError> {
        let invalid = |schema: &ParameterSchema, reason: String| CapError::InvalidSchema {
            capability: descriptor.name.clone(),
            parameter: schema.name.clone(),
            reason,
        };
        for schema in &descriptor.parameters {
            let Some(pattern) = &schema.pattern else {
                continue;
            };
            let re = self
                .compiled(pattern)
                .map_err(|e| invalid(schema, format!("invalid pattern: {e}")))?;
            if !schema.required
                && let Some(Value::String(default)) = &schema.default
                && !re.is_match(default)
            {
                return Err(invalid(schema, format!("default value does not match pattern {pattern}")));
            }
        }
        Ok(())
    }

    /// Cached anchored regex for `pattern`, compiled on first use.
    fn compiled(&self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(re) = self
            .patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
        {
            return Ok(re.clone());
        }
        let re = anchored(pattern)?;
        self.patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    #[cfg(test)]
    fn cached_patterns(&self) -> usize {
        self.patterns.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check `params` against `descriptor` at `level`.
    pub fn validate(
        &self,
        descriptor: &CapabilityDescriptor,
        params: &Params,
        level: ValidationLevel,
    ) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        for key in params.keys() {
            if descriptor.parameter(key).is_none() {
                outcome.add_error(key, "unknown parameter");
            }
        }

        for schema in &descriptor.parameters {
            let supplied = params.get(&schema.name).filter(|v| !v.is_null());
            let Some(raw) = supplied else {
                if schema.required {
                    outcome.add_error(&schema.name, "required");
                } else if let Some(default) = &schema.default {
                    outcome.converted.insert(schema.name.clone(), default.clone());
                }
                continue;
            };

            match coerce(schema.param_type, raw, level) {
                Err(message) => outcome.add_error(&schema.name, message),
                Ok(Coerced { value, from }) => {
                    if let Some(from) = from {
                        outcome.add_warning(
                            &schema.name,
                            format!("coerced from {from} to {}", schema.param_type),
                        );
                    }
                    self.check_constraints(schema, &value, &mut outcome);
                    outcome.converted.insert(schema.name.clone(), value);
                }
            }
        }

        if level.scans_risks() {
            outcome.security_risks = self.scan(&outcome.converted);
        }
        outcome.valid = outcome.errors.is_empty();
        outcome
    }

    /// Run every rule over every string inside `params`.
    ///
    /// Each (field, rule) pair is reported at most once.
    pub fn scan(&self, params: &Params) -> Vec<SecurityRisk> {
        let mut seen = BTreeSet::new();
        let mut risks = Vec::new();
        for (field, value) in params {
            let mut strings = Vec::new();
            collect_strings(value, &mut strings);
            for rule in &self.rules {
                let hit = strings.iter().filter_map(|s| rule.scan(s)).max();
                if let Some(severity) = hit
                    && seen.insert((field.clone(), rule.name().to_string()))
                {
                    risks.push(SecurityRisk {
                        field: field.clone(),
                        rule: rule.name().to_string(),
                        severity,
                    });
                }
            }
        }
        risks
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

// ────────────────────────────────────────────────────────────────────────────
// Coercion
// ────────────────────────────────────────────────────────────────────────────

struct Coerced {
    value: Value,
    /// Original JSON kind when a lossy-looking conversion happened.
    from: Option<&'static str>,
}

impl Coerced {
    fn exact(value: Value) -> Self {
        Self { value, from: None }
    }

    fn from(value: Value, kind: &'static str) -> Self {
        Self {
            value,
            from: Some(kind),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn coerce(ty: ParameterType, raw: &Value, level: ValidationLevel) -> Result<Coerced, String> {
    let mismatch = || format!("expected {ty}, got {}", json_kind(raw));

    if ty.matches(raw) {
        // Integer → float widening is silent at every level.
        if ty == ParameterType::Float
            && !raw.is_f64()
            && let Some(n) = raw.as_f64().and_then(Number::from_f64)
        {
            return Ok(Coerced::exact(Value::Number(n)));
        }
        return Ok(Coerced::exact(raw.clone()));
    }
    if level == ValidationLevel::Strict {
        return Err(mismatch());
    }

    let kind = json_kind(raw);
    let converted = match (ty, raw) {
        (ParameterType::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        (ParameterType::Integer, Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| Value::from(f as i64)),
        (ParameterType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (ParameterType::Boolean, Value::String(s)) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "off" | "0" => Some(Value::Bool(false)),
                _ => None,
            }
        }
        (ParameterType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(1) => Some(Value::Bool(true)),
            Some(0) => Some(Value::Bool(false)),
            _ => None,
        },
        (ParameterType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (ParameterType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (ParameterType::Array, Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_array),
        (ParameterType::Object, Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object),
        _ => None,
    };

    converted
        .map(|value| Coerced::from(value, kind))
        .ok_or_else(mismatch)
}

// ────────────────────────────────────────────────────────────────────────────
// Constraints
// ────────────────────────────────────────────────────────────────────────────

impl Validator {
    fn check_constraints(&self, schema: &ParameterSchema, value: &Value, outcome: &mut ValidationOutcome) {
        let field = schema.name.as_str();
        for message in schema.constraint_errors(value) {
            outcome.add_error(field, message);
        }

        if let (Some(pattern), Value::String(s)) = (&schema.pattern, value) {
            match self.compiled(pattern) {
                Ok(re) if re.is_match(s) => {}
                Ok(_) => outcome.add_error(field, format!("does not match pattern {pattern}")),
                Err(_) => outcome.add_error(field, "schema pattern does not compile"),
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

fn contains_any(value: &str, needles: &[&str]) -> bool {
    let lowered = value.to_ascii_lowercase();
    needles.iter().any(|n| lowered.contains(n))
}

/// Parent-directory traversal, raw or percent-encoded.
pub struct PathTraversalRule;

impl RiskRule for PathTraversalRule {
    fn name(&self) -> &str {
        "path_traversal"
    }

    fn scan(&self, value: &str) -> Option<RiskSeverity> {
        contains_any(value, &["../", "..\\", "%2e%2e", "..%2f", "..%5c"]).then_some(RiskSeverity::High)
    }
}

/// Embedded NUL bytes, raw or percent-encoded.
pub struct NullByteRule;

impl RiskRule for NullByteRule {
    fn name(&self) -> &str {
        "null_byte"
    }

    fn scan(&self, value: &str) -> Option<RiskSeverity> {
        (value.contains('\0') || contains_any(value, &["%00"])).then_some(RiskSeverity::Critical)
    }
}

/// Shell metacharacters that chain or substitute commands.
pub struct CommandInjectionRule;

impl RiskRule for CommandInjectionRule {
    fn name(&self) -> &str {
        "command_injection"
    }

    fn scan(&self, value: &str) -> Option<RiskSeverity> {
        contains_any(
            value,
            &["$(", "`", "; rm ", ";rm ", "&& ", "|| ", "| sh", "| bash", "; curl ", "; wget "],
        )
        .then_some(RiskSeverity::High)
    }
}

/// Classic SQL injection fragments.
pub struct SqlInjectionRule;

impl RiskRule for SqlInjectionRule {
    fn name(&self) -> &str {
        "sql_injection"
    }

    fn scan(&self, value: &str) -> Option<RiskSeverity> {
        contains_any(
            value,
            &["' or '1'='1", "' or 1=1", "union select", "drop table", "'--", "'; --"],
        )
        .then_some(RiskSeverity::High)
    }
}

/// Markup that executes script in a browser.
pub struct ScriptInjectionRule;

impl RiskRule for ScriptInjectionRule {
    fn name(&self) -> &str {
        "script_injection"
    }

    fn scan(&self, value: &str) -> Option<RiskSeverity> {
        contains_any(value, &["<script", "javascript:", "onerror=", "onload="])
            .then_some(RiskSeverity::Medium)
    }
}

/// Absolute references to sensitive system locations.
pub struct SystemPathRule;

impl RiskRule for SystemPathRule {
    fn name(&self) -> &str {
        "system_path"
    }

    fn scan(&self, value: &str) -> Option<RiskSeverity> {
        let lowered = value.trim().to_ascii_lowercase();
        ["/etc/", "/proc/", "/sys/", "/root/", "c:\\windows"]
            .iter()
            .any(|p| lowered.starts_with(p))
            .then_some(RiskSeverity::Low)
    }
}
