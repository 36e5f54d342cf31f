//! Validation outcomes and security-risk classification.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Params;

/// Field name → messages.
pub type FieldMessages = BTreeMap<String, Vec<String>>;

/// How much work the validator does.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Structural checks and lenient coercion only.
    Basic,
    /// Structural checks, lenient coercion, and security-risk scanning.
    #[default]
    Standard,
    /// Structural checks and risk scanning; only integer→float widening is
    /// accepted as a coercion.
    Strict,
}

impl ValidationLevel {
    pub fn scans_risks(self) -> bool {
        self != ValidationLevel::Basic
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationLevel::Basic => "basic",
            ValidationLevel::Standard => "standard",
            ValidationLevel::Strict => "strict",
        }
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" | "baseline" => Ok(ValidationLevel::Basic),
            "standard" => Ok(ValidationLevel::Standard),
            "strict" => Ok(ValidationLevel::Strict),
            other => Err(format!("unknown validation level '{other}'")),
        }
    }
}

/// Severity attached to a detected risk indicator.  Ordered low → critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskSeverity::Low => "low",
            RiskSeverity::Medium => "medium",
            RiskSeverity::High => "high",
            RiskSeverity::Critical => "critical",
        })
    }
}

impl FromStr for RiskSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskSeverity::Low),
            "medium" => Ok(RiskSeverity::Medium),
            "high" => Ok(RiskSeverity::High),
            "critical" => Ok(RiskSeverity::Critical),
            other => Err(format!("unknown risk severity '{other}'")),
        }
    }
}

/// A risk indicator found in one field's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SecurityRisk {
    pub field: String,
    /// Name of the rule that fired, e.g. `"path_traversal"`.
    pub rule: String,
    pub severity: RiskSeverity,
}

/// Result of validating raw arguments against a schema.
///
/// `valid` reflects structural checks only; `security_risks` is an
/// independent axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: FieldMessages,
    pub warnings: FieldMessages,
    pub security_risks: Vec<SecurityRisk>,
    /// Type-correct parameters with defaults applied.
    pub converted: Params,
}

impl ValidationOutcome {
    pub fn add_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn add_warning(&mut self, field: &str, message: impl Into<String>) {
        self.warnings
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    /// Highest severity among detected risks.
    pub fn max_risk(&self) -> Option<RiskSeverity> {
        self.security_risks.iter().map(|r| r.severity).max()
    }

    /// `"field: msg, msg; field: msg"`.
    pub fn error_summary(&self) -> String {
        summarize(&self.errors)
    }
}

/// Body of a `ValidationFailed` error.  Parameter snapshots are redacted
/// before this value is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFailure {
    pub capability: String,
    pub errors: FieldMessages,
    pub warnings: FieldMessages,
    pub security_risks: Vec<SecurityRisk>,
    pub provided_parameters: Params,
    pub converted_parameters: Params,
}

impl ValidationFailure {
    pub fn error_summary(&self) -> String {
        summarize(&self.errors)
    }
}

fn summarize(errors: &FieldMessages) -> String {
    errors
        .iter()
        .map(|(field, msgs)| format!("{field}: {}", msgs.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}
