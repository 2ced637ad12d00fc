//! Sink contract between the dispatcher and the subscription-serving layer

use async_trait::async_trait;

use taskfeed_core::{TaskEvent, TaskId};

/// Error type for sink operations
///
/// Every variant is a transient delivery failure from the dispatcher's
/// point of view: the attempt is retried with backoff and eventually
/// escalated, never silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The transport refused the event
    #[error("sink rejected delivery: {0}")]
    Rejected(String),

    /// The underlying connection is gone
    #[error("sink closed")]
    Closed,
}

/// A subscriber's live delivery channel
///
/// Implemented by the subscription-serving layer (e.g. a gateway mapping a
/// push-stream transport onto this trait). The dispatcher bounds each call
/// with its configured send timeout and guarantees per-partition sequential
/// delivery: `send` is never invoked for the next sequence until the current
/// one has been acknowledged through the registry.
///
/// Delivery is at-least-once; implementations must treat
/// `(task_id, sequence)` as an idempotency key.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Push one event to the subscriber
    async fn send(&self, event: &TaskEvent) -> Result<(), SinkError>;

    /// Surface an unrecoverable replay gap
    ///
    /// Everything at or below `floor` has passed out of retention and will
    /// not be replayed; delivery resumes after it. The layer behind the sink
    /// is expected to translate this into a client-visible notice (typically
    /// prompting a fresh query of task state).
    async fn notify_missed(&self, task_id: TaskId, floor: u64) -> Result<(), SinkError>;
}
