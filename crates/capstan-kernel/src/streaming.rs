//! Incremental result delivery for streaming capabilities.
//!
//! A streaming invocation produces an ordered [`EnvelopeStream`]:
//!
//! ```text
//! seq 1  processing  0.25  "step 1/4"   final=false
//! seq 2  processing  0.50  "step 2/4"   final=false
//! ...
//! seq N  completed   1.00  "completed"  final=true   ← net result
//! ```
//!
//! The capability body runs in its own task and reports through the
//! [`ProgressSink`] on its [`ExecutionContext`].  The consumer pulls
//! envelopes at its own pace; the body never waits on the consumer.
//! Dropping the stream cancels the invocation.
//!
//! | Rule                          | Enforced by                          |
//! |-------------------------------|--------------------------------------|
//! | sequence strictly increasing  | counter under the sink's lock        |
//! | completion within `[0, 1]`    | [`ProgressSink::report`] clamps      |
//! | exactly one final envelope    | phase machine rejects post-terminal  |
//! | final envelope last           | stream ends after the final envelope |

use std::sync::{Arc, Mutex, PoisonError};

use capstan_types::{ExecutionResult, Params, StreamPhase, StreamingEnvelope};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::capability::Capability;
use crate::context::{CancelFlag, ExecutionContext};
use crate::executor::Executor;

/// Ordered, finite stream of envelopes for one invocation.
pub type EnvelopeStream = BoxStream<'static, StreamingEnvelope>;

// ────────────────────────────────────────────────────────────────────────────
// ProgressSink
// ────────────────────────────────────────────────────────────────────────────

/// Write side of a streaming invocation.
///
/// Clones share one channel and one sequence counter.  A disabled sink
/// (the default) accepts and drops every report.
#[derive(Clone, Default)]
pub struct ProgressSink {
    channel: Option<Arc<Channel>>,
}

struct Channel {
    state: Mutex<StreamState>,
    tx: mpsc::UnboundedSender<StreamingEnvelope>,
    cancel: CancelFlag,
}

struct StreamState {
    phase: StreamPhase,
    next_sequence: u64,
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl ProgressSink {
    /// A sink that drops every report.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open a live sink and the receiver its envelopes arrive on.
    pub(crate) fn open(cancel: CancelFlag) -> (Self, mpsc::UnboundedReceiver<StreamingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel {
            state: Mutex::new(StreamState {
                phase: StreamPhase::Initializing,
                next_sequence: 1,
            }),
            tx,
            cancel,
        };
        (
            Self {
                channel: Some(Arc::new(channel)),
            },
            rx,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.channel.is_some()
    }

    /// Emit a non-final `processing` envelope.
    ///
    /// `completion` is clamped to `[0, 1]`; a non-finite value is rejected.
    /// Returns `false` when the report was dropped (disabled sink, consumer
    /// gone, invocation cancelled or already terminal).
    pub fn report(
        &self,
        completion: f64,
        status: impl Into<String>,
        partial: Option<Value>,
    ) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };
        if !completion.is_finite() {
            warn!(completion, "progress report with non-finite completion dropped");
            return false;
        }
        if channel.cancel.is_cancelled() {
            return false;
        }

        let mut state = channel.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.phase.can_transition_to(StreamPhase::Processing) {
            return false;
        }
        state.phase = StreamPhase::Processing;
        let envelope = StreamingEnvelope {
            sequence: state.next_sequence,
            phase: StreamPhase::Processing,
            completion: completion.clamp(0.0, 1.0),
            status: status.into(),
            is_final: false,
            result: ExecutionResult::success(partial.unwrap_or(Value::Null)),
        };
        state.next_sequence += 1;

        if channel.tx.send(envelope).is_err() {
            // Consumer dropped the stream.
            channel.cancel.cancel();
            return false;
        }
        true
    }

    /// Emit the single final envelope carrying `result`.
    ///
    /// Success passes through `finalizing` to `completed`; failure moves to
    /// `error`.  Returns `false` if the sink is disabled or already terminal.
    pub(crate) fn finish(&self, result: ExecutionResult) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };
        let mut state = channel.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.phase.is_terminal() {
            return false;
        }

        let (phase, status) = if result.is_success() {
            state.phase = StreamPhase::Finalizing;
            (StreamPhase::Completed, "completed".to_string())
        } else {
            let status = result.error().unwrap_or("error").to_string();
            (StreamPhase::Error, status)
        };
        state.phase = phase;

        let envelope = StreamingEnvelope {
            sequence: state.next_sequence,
            phase,
            completion: 1.0,
            status,
            is_final: true,
            result,
        };
        state.next_sequence += 1;
        if channel.tx.send(envelope).is_err() {
            debug!("final envelope discarded: consumer gone");
        }
        true
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Driver
// ────────────────────────────────────────────────────────────────────────────

/// Run `capability` in a background task and return its envelope stream.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn spawn_streaming(
    executor: Arc<Executor>,
    capability: Arc<dyn Capability>,
    ctx: ExecutionContext,
    params: Params,
) -> EnvelopeStream {
    // The invocation gets its own flag so dropping the stream never cancels
    // the caller's flag, while cancelling the caller's flag still reaches it.
    let cancel = ctx.cancel_flag().child();
    let (sink, rx) = ProgressSink::open(cancel.clone());
    let ctx = ctx.with_cancel_flag(cancel.clone()).with_progress(sink.clone());

    tokio::spawn(async move {
        let result = executor.execute(capability.as_ref(), &ctx, &params).await;
        sink.finish(result);
    });

    envelope_stream(rx, cancel)
}

/// Stream-from-receiver adapter.  Ends after the final envelope even if a
/// sink clone outlives the invocation; dropping it cancels the invocation's
/// own flag.
fn envelope_stream(
    rx: mpsc::UnboundedReceiver<StreamingEnvelope>,
    cancel: CancelFlag,
) -> EnvelopeStream {
    struct Reader {
        rx: mpsc::UnboundedReceiver<StreamingEnvelope>,
        done: bool,
        _guard: CancelOnDrop,
    }

    let reader = Reader {
        rx,
        done: false,
        _guard: CancelOnDrop(cancel),
    };

    stream::unfold(reader, |mut reader| async move {
        if reader.done {
            return None;
        }
        let envelope = reader.rx.recv().await?;
        reader.done = envelope.is_final;
        Some((envelope, reader))
    })
    .boxed()
}

struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Drain a stream and keep only its final envelope's result.
///
/// Returns an execution-failed result if the stream ends without a final
/// envelope.
pub async fn final_result(mut stream: EnvelopeStream) -> ExecutionResult {
    while let Some(envelope) = stream.next().await {
        if envelope.is_final {
            return envelope.result;
        }
    }
    ExecutionResult::failure(
        capstan_types::FailureKind::ExecutionFailed,
        "Capability execution failed",
    )
}
