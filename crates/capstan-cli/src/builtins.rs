//! Demo capabilities registered at start-up.
//!
//! | Name        | Tier    | Streaming | Purpose                              |
//! |-------------|---------|-----------|--------------------------------------|
//! | `echo`      | read    | no        | return `msg` unchanged               |
//! | `transform` | read    | no        | upper/lower/reverse a string         |
//! | `sleep`     | execute | no        | wait, to exercise timeouts           |
//! | `countdown` | read    | yes       | emit one progress envelope per step  |
//! | `env`       | admin   | no        | report whether an env var is set     |

use std::time::Duration;

use capstan_kernel::{CapabilityRegistry, FnCapability};
use capstan_types::{
    CapError, CapabilityDescriptor, ParameterSchema, ParameterType, Permission,
};
use serde_json::{Value, json};

/// Register every demo capability on `registry`.
pub fn register_all(registry: &CapabilityRegistry) -> Result<usize, CapError> {
    let echo = CapabilityDescriptor::builder("echo")
        .description("Return the message unchanged")
        .category("utility")
        .tags(["text", "demo"])
        .permission(Permission::Read)
        .parameter(ParameterSchema::required("msg", ParameterType::String, "Message to echo"))
        .build()?;
    registry.register(FnCapability::shared(echo, |_ctx, p| async move {
        Ok(p.get("msg").cloned().unwrap_or(Value::Null))
    }))?;

    let transform = CapabilityDescriptor::builder("transform")
        .description("Change the case of a string or reverse it")
        .category("utility")
        .tag("text")
        .permission(Permission::Read)
        .parameter(
            ParameterSchema::required("text", ParameterType::String, "Input text")
                .with_length(None, Some(10_000)),
        )
        .parameter(
            ParameterSchema::optional("mode", ParameterType::String, "upper, lower or reverse", json!("upper"))
                .with_choices([json!("upper"), json!("lower"), json!("reverse")]),
        )
        .build()?;
    registry.register(FnCapability::shared(transform, |_ctx, p| async move {
        let text = p.get("text").and_then(Value::as_str).unwrap_or_default();
        let out = match p.get("mode").and_then(Value::as_str) {
            Some("lower") => text.to_lowercase(),
            Some("reverse") => text.chars().rev().collect(),
            _ => text.to_uppercase(),
        };
        Ok(json!(out))
    }))?;

    let sleep = CapabilityDescriptor::builder("sleep")
        .description("Wait for a number of seconds")
        .category("diagnostics")
        .tag("timing")
        .permission(Permission::Execute)
        .timeout(Duration::from_secs(10))
        .parameter(
            ParameterSchema::optional("seconds", ParameterType::Float, "Duration to wait", json!(1.0))
                .with_range(Some(0.0), Some(60.0)),
        )
        .build()?;
    registry.register(FnCapability::shared(sleep, |_ctx, p| async move {
        let secs = p.get("seconds").and_then(Value::as_f64).unwrap_or(1.0);
        let wait = Duration::try_from_secs_f64(secs)
            .map_err(|e| CapError::ExecutionFailed(e.to_string()))?;
        tokio::time::sleep(wait).await;
        Ok(json!({ "slept": secs }))
    }))?;

    let countdown = CapabilityDescriptor::builder("countdown")
        .description("Count down, reporting progress at every step")
        .category("diagnostics")
        .tags(["timing", "streaming"])
        .permission(Permission::Read)
        .streaming(true)
        .timeout(Duration::from_secs(120))
        .parameter(
            ParameterSchema::optional("steps", ParameterType::Integer, "Number of steps", json!(5))
                .with_range(Some(1.0), Some(100.0)),
        )
        .parameter(
            ParameterSchema::optional("interval_ms", ParameterType::Integer, "Delay per step", json!(100))
                .with_range(Some(0.0), Some(5000.0)),
        )
        .build()?;
    registry.register(FnCapability::shared(countdown, |ctx, p| async move {
        let steps = p.get("steps").and_then(Value::as_u64).unwrap_or(5).max(1);
        let interval = Duration::from_millis(p.get("interval_ms").and_then(Value::as_u64).unwrap_or(100));
        for i in 1..=steps {
            tokio::time::sleep(interval).await;
            let remaining = steps - i;
            ctx.progress().report(
                i as f64 / steps as f64,
                format!("{remaining} remaining"),
                Some(json!({ "remaining": remaining })),
            );
        }
        Ok(json!({ "steps": steps }))
    }))?;

    let env = CapabilityDescriptor::builder("env")
        .description("Report whether an environment variable is set")
        .category("system")
        .tag("host")
        .permission(Permission::Admin)
        .parameter(
            ParameterSchema::required("name", ParameterType::String, "Variable name")
                .with_pattern("[A-Za-z_][A-Za-z0-9_]*"),
        )
        .build()?;
    registry.register(FnCapability::shared(env, |_ctx, p| async move {
        let name = p.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
        let set = std::env::var_os(&name).is_some();
        Ok(json!({ "name": name, "set": set }))
    }))?;

    Ok(registry.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_kernel::ExecutionContext;
    use capstan_types::{Params, PermissionLevel};
    use futures_util::StreamExt;

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    fn registry() -> CapabilityRegistry {
        let r = CapabilityRegistry::new();
        assert_eq!(register_all(&r).unwrap(), 5);
        r
    }

    #[test]
    fn registering_twice_fails() {
        let r = registry();
        assert!(matches!(register_all(&r), Err(CapError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn transform_applies_default_mode() {
        let r = registry();
        let ctx = ExecutionContext::new("t", PermissionLevel::Guest);
        let out = r
            .execute("transform", &ctx, &params(json!({"text": "abc"})))
            .await
            .unwrap();
        assert_eq!(out.payload(), Some(&json!("ABC")));

        let out = r
            .execute("transform", &ctx, &params(json!({"text": "abc", "mode": "reverse"})))
            .await
            .unwrap();
        assert_eq!(out.payload(), Some(&json!("cba")));
    }

    #[tokio::test]
    async fn countdown_streams_every_step() {
        let r = registry();
        let ctx = ExecutionContext::new("t", PermissionLevel::Guest);
        let envelopes: Vec<_> = r
            .execute_streaming("countdown", &ctx, &params(json!({"steps": 3, "interval_ms": 0})))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(envelopes.len(), 4);
        assert_eq!(envelopes[2].result.payload(), Some(&json!({"remaining": 0})));
        assert_eq!(envelopes[3].result.payload(), Some(&json!({"steps": 3})));
    }

    #[tokio::test]
    async fn env_requires_admin_and_a_valid_name() {
        let r = registry();
        let user = ExecutionContext::new("u", PermissionLevel::User);
        assert!(matches!(
            r.execute("env", &user, &params(json!({"name": "HOME"}))).await,
            Err(CapError::PermissionDenied { .. })
        ));

        let admin = ExecutionContext::new("a", PermissionLevel::Admin);
        assert!(matches!(
            r.execute("env", &admin, &params(json!({"name": "BAD NAME"}))).await,
            Err(CapError::ValidationFailed(_))
        ));
        let ok = r
            .execute("env", &admin, &params(json!({"name": "CAPSTAN_SURELY_UNSET_VAR"})))
            .await
            .unwrap();
        assert_eq!(ok.payload().unwrap()["set"], json!(false));
        assert_eq!(r.audit_log().len(), 1);
    }
}
