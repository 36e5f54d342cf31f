//! Typed, constrained description of a single capability input field.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
}

impl ParameterType {
    /// `true` when `value` already has this type, with no coercion.
    ///
    /// Integers are accepted where a float is declared.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::Float => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Array => value.is_array(),
            ParameterType::Object => value.is_object(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Float => "float",
            ParameterType::Boolean => "boolean",
            ParameterType::Array => "array",
            ParameterType::Object => "object",
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(ParameterType::String),
            "integer" | "int" => Ok(ParameterType::Integer),
            "float" | "number" => Ok(ParameterType::Float),
            "boolean" | "bool" => Ok(ParameterType::Boolean),
            "array" | "list" => Ok(ParameterType::Array),
            "object" | "dict" => Ok(ParameterType::Object),
            other => Err(format!("unknown parameter type '{other}'")),
        }
    }
}

/// Schema of one input field.
///
/// The serialized form is the registration surface accepted from capability
/// providers: `{name, type, description, required, default?, min?, max?,
/// minLength?, maxLength?, choices?, pattern?}`.
///
/// Every schema is *total*: a field that is not required must carry a
/// default, which [`ParameterSchema::check`] enforces at registration time.
///
/// ```
/// use capstan_types::{ParameterSchema, ParameterType};
/// use serde_json::json;
///
/// let retries = ParameterSchema::optional("retries", ParameterType::Integer, "Retry budget", json!(3))
///     .with_range(Some(0.0), Some(10.0));
/// assert!(retries.check().is_ok());
///
/// let mut broken = ParameterSchema::required("msg", ParameterType::String, "Message");
/// broken.required = false;
/// assert!(broken.check().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "min", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, rename = "max", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ParameterSchema {
    /// A required field with no default.
    pub fn required(
        name: impl Into<String>,
        param_type: ParameterType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
            min_value: None,
            max_value: None,
            min_length: None,
            max_length: None,
            choices: None,
            pattern: None,
        }
    }

    /// An optional field resolved to `default` when absent.
    pub fn optional(
        name: impl Into<String>,
        param_type: ParameterType,
        description: impl Into<String>,
        default: Value,
    ) -> Self {
        Self {
            required: false,
            default: Some(default),
            ..Self::required(name, param_type, description)
        }
    }

    /// Inclusive numeric bounds.
    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    /// Inclusive length bounds for strings (in characters) and arrays.
    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_choices(mut self, choices: impl IntoIterator<Item = Value>) -> Self {
        self.choices = Some(choices.into_iter().collect());
        self
    }

    /// A regular expression the whole string value must match.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Check the schema's own invariants.
    ///
    /// Returns a human-readable reason on the first defect found.  Pattern
    /// syntax is not checked here; the validator compiles patterns.
    pub fn check(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("parameter name must not be empty".to_string());
        }
        if !self.required {
            match &self.default {
                None | Some(Value::Null) => {
                    return Err("optional parameter must declare a default".to_string());
                }
                Some(default) if !self.param_type.matches(default) => {
                    return Err(format!("default value is not of type {}", self.param_type));
                }
                Some(_) => {}
            }
        }
        if let (Some(min), Some(max)) = (self.min_value, self.max_value)
            && min > max
        {
            return Err(format!("min {min} exceeds max {max}"));
        }
        if let (Some(min), Some(max)) = (self.min_length, self.max_length)
            && min > max
        {
            return Err(format!("minLength {min} exceeds maxLength {max}"));
        }
        if let Some(choices) = &self.choices
            && choices.is_empty()
        {
            return Err("choices must not be empty".to_string());
        }
        if !self.required
            && let Some(default) = &self.default
            && let Some(reason) = self.constraint_errors(default).into_iter().next()
        {
            return Err(format!("default value {reason}"));
        }
        Ok(())
    }

    /// Range, length, and choices violations of an already-typed `value`.
    ///
    /// Numbers are range-checked; strings (by character) and arrays are
    /// length-checked.  Patterns are left to the validator.
    pub fn constraint_errors(&self, value: &Value) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min_value
                && n < min
            {
                errors.push(format!("must be >= {min}"));
            }
            if let Some(max) = self.max_value
                && n > max
            {
                errors.push(format!("must be <= {max}"));
            }
        }

        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(len) = length {
            if let Some(min) = self.min_length
                && len < min
            {
                errors.push(format!("length must be >= {min}"));
            }
            if let Some(max) = self.max_length
                && len > max
            {
                errors.push(format!("length must be <= {max}"));
            }
        }

        if let Some(choices) = &self.choices
            && !choices.iter().any(|c| same_value(c, value))
        {
            let listed = choices
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            errors.push(format!("must be one of [{listed}]"));
        }

        errors
    }
}

/// JSON equality that treats `5` and `5.0` as equal.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
