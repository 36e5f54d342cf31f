//! [`AuditLog`] – bounded, append-only record of highest-tier executions.
//!
//! Records are kept in a sliding window of `capacity` entries (oldest
//! evicted first), emitted on the `capstan::audit` tracing target, and
//! fanned out to live subscribers.  Parameters are redacted before a record
//! is built.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use capstan_types::{AuditEvent, AuditRecord, Params};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::redaction::{REDACTED, redact};

pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

const SUBSCRIBER_BUFFER: usize = 64;

/// Bounded audit log.
///
/// # Example
///
/// ```
/// use capstan_kernel::AuditLog;
///
/// let log = AuditLog::new(2);
/// assert_eq!(log.capacity(), 2);
/// assert!(log.is_empty());
/// ```
pub struct AuditLog {
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
    sender: broadcast::Sender<AuditRecord>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditLog {
    /// A log holding at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY))),
            sender,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `record`, evicting the oldest entries beyond capacity.
    pub fn record(&self, record: AuditRecord) {
        info!(
            target: "capstan::audit",
            capability = %record.capability,
            caller = %record.caller_id,
            permission = %record.permission,
            request_id = %record.request_id,
            event = ?record.event,
            parameters = %serde_json::Value::Object(record.parameters.clone()),
            "admin capability execution"
        );

        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.push_back(record.clone());
            while records.len() > self.capacity {
                records.pop_front();
            }
        }
        // No subscribers is fine.
        let _ = self.sender.send(record);
    }

    /// Build and append a record for `capability` from `ctx` and the
    /// caller-supplied `params`.
    pub fn record_execution(
        &self,
        capability: &str,
        ctx: &ExecutionContext,
        params: &Params,
        event: AuditEvent,
    ) -> AuditRecord {
        let record = AuditRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            capability: capability.to_string(),
            caller_id: ctx.caller_id.clone(),
            permission: ctx.permission,
            session_id: ctx.session_id.clone(),
            request_id: ctx.request_id,
            parameters: redact(params),
            working_directory: ctx.working_directory.as_ref().map(|_| REDACTED.to_string()),
            event,
        };
        self.record(record.clone());
        record
    }

    /// Receive every record appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    /// All retained records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().iter().cloned().collect()
    }

    /// The newest `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditRecord> {
        let records = self.lock();
        let skip = records.len().saturating_sub(n);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
