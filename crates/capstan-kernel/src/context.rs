//! [`ExecutionContext`] – per-call identity, permission, and environment.
//!
//! A context is created once per call by the caller.  The executor derives
//! an enriched copy (see [`ExecutionContext::enriched`]) and never mutates
//! the original.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use capstan_types::{PermissionLevel, ValidationLevel};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::streaming::ProgressSink;

/// Environment key the executor sets to the running capability's name.
pub const ENV_CAPABILITY: &str = "CAPSTAN_CAPABILITY";
/// Environment key the executor sets to the call's request id.
pub const ENV_REQUEST_ID: &str = "CAPSTAN_REQUEST_ID";

// ────────────────────────────────────────────────────────────────────────────
// CancelFlag
// ────────────────────────────────────────────────────────────────────────────

/// Shared cancellation flag.  Clones observe the same state.
///
/// A flag made with [`child`](CancelFlag::child) is cancelled whenever its
/// parent is, but cancelling the child leaves the parent alone.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the call cancelled and wake every waiter, including those of
    /// child flags.  Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// A new flag linked one way to this one: cancelling `self` cancels the
    /// child, cancelling the child does not touch `self`.
    pub fn child(&self) -> CancelFlag {
        let child = CancelFlag::new();
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        // Checked after registering so a concurrent `cancel` is never missed.
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // `cancel` cannot slip between the check and the wait.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ExecutionContext
// ────────────────────────────────────────────────────────────────────────────

/// Identity and environment bundle for one call.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use capstan_kernel::ExecutionContext;
/// use capstan_types::PermissionLevel;
///
/// let ctx = ExecutionContext::new("alice", PermissionLevel::User)
///     .with_session("s-1")
///     .with_timeout_override(Duration::from_secs(2));
///
/// // An override wins over the capability's own budget.
/// assert_eq!(ctx.effective_timeout(Duration::from_secs(30)), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub caller_id: String,
    pub permission: PermissionLevel,
    pub session_id: Option<String>,
    pub request_id: Uuid,
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub timeout_override: Option<Duration>,
    pub dry_run: bool,
    /// Per-call override of the registry's default validation level.
    pub validation_level: Option<ValidationLevel>,
    cancel: CancelFlag,
    progress: ProgressSink,
}

impl ExecutionContext {
    /// A fresh context with a new request id and no environment.
    pub fn new(caller_id: impl Into<String>, permission: PermissionLevel) -> Self {
        Self {
            caller_id: caller_id.into(),
            permission,
            session_id: None,
            request_id: Uuid::new_v4(),
            working_directory: None,
            environment: BTreeMap::new(),
            timeout_override: None,
            dry_run: false,
            validation_level: None,
            cancel: CancelFlag::new(),
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_override(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_validation_level(mut self, level: ValidationLevel) -> Self {
        self.validation_level = Some(level);
        self
    }

    /// Share an externally owned cancel flag with this call.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Progress channel for streaming capabilities.  Outside a streaming
    /// call this is a disabled sink and every report is dropped.
    pub fn progress(&self) -> &ProgressSink {
        &self.progress
    }

    pub(crate) fn with_progress(&self, progress: ProgressSink) -> Self {
        let mut ctx = self.clone();
        ctx.progress = progress;
        ctx
    }

    /// The override when it is positive, otherwise `own`.
    pub fn effective_timeout(&self, own: Duration) -> Duration {
        self.timeout_override
            .filter(|t| !t.is_zero())
            .unwrap_or(own)
    }

    /// Copy of this context with executor-provided environment entries.
    pub fn enriched(&self, capability: &str) -> Self {
        let mut ctx = self.clone();
        ctx.environment
            .insert(ENV_CAPABILITY.to_string(), capability.to_string());
        ctx.environment
            .insert(ENV_REQUEST_ID.to_string(), self.request_id.to_string());
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_override_falls_back_to_own_timeout() {
        let ctx = ExecutionContext::new("a", PermissionLevel::Guest)
            .with_timeout_override(Duration::ZERO);
        assert_eq!(ctx.effective_timeout(Duration::from_secs(3)), Duration::from_secs(3));
    }

    #[test]
    fn no_override_uses_own_timeout() {
        let ctx = ExecutionContext::new("a", PermissionLevel::Guest);
        assert_eq!(ctx.effective_timeout(Duration::from_secs(7)), Duration::from_secs(7));
    }

    #[test]
    fn enriched_copy_leaves_original_untouched() {
        let ctx = ExecutionContext::new("a", PermissionLevel::User).with_env("HOME", "/home/a");
        let enriched = ctx.enriched("echo");
        assert_eq!(enriched.environment.get(ENV_CAPABILITY).map(String::as_str), Some("echo"));
        assert_eq!(
            enriched.environment.get(ENV_REQUEST_ID),
            Some(&ctx.request_id.to_string())
        );
        assert!(!ctx.environment.contains_key(ENV_CAPABILITY));
        assert_eq!(enriched.environment.get("HOME").map(String::as_str), Some("/home/a"));
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let ctx = ExecutionContext::new("a", PermissionLevel::Guest);
        let copy = ctx.clone();
        assert!(!copy.is_cancelled());
        ctx.cancel_flag().cancel();
        assert!(copy.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let flag = CancelFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let flag = CancelFlag::new();
        flag.cancel();
        tokio::time::timeout(Duration::from_millis(100), flag.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    fn cancelling_a_child_leaves_the_parent_running() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_a_cancelled_parent_starts_cancelled() {
        let parent = CancelFlag::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_wakes_child_waiters() {
        let parent = CancelFlag::new();
        let child = parent.child();
        let grandchild = child.child();
        let waiter = {
            let grandchild = grandchild.clone();
            tokio::spawn(async move { grandchild.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("grandchild must wake")
            .unwrap();
        assert!(child.is_cancelled());
    }

    #[test]
    fn dropped_children_are_pruned() {
        let parent = CancelFlag::new();
        for _ in 0..10 {
            drop(parent.child());
        }
        let _live = parent.child();
        let registered = parent.inner.children.lock().unwrap().len();
        assert_eq!(registered, 1);
    }
}
