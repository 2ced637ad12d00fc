//! EventLog trait definition and retention policy

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskfeed_core::{EventKind, TaskEvent, TaskId};

/// Error type for event log operations
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// Durable persistence could not be guaranteed; the event must be
    /// assumed absent from the log
    #[error("partition {task_id} unavailable: {reason}")]
    PartitionUnavailable { task_id: TaskId, reason: String },

    /// The requested range starts below the retained floor
    ///
    /// `floor` is the lowest sequence still retained in the partition.
    /// Everything at or below it has to be treated as missed.
    #[error("partition {task_id} no longer retains events at or below sequence {floor}")]
    RetentionGap { task_id: TaskId, floor: u64 },

    /// Backend failure on a non-append path
    #[error("storage error: {0}")]
    Storage(String),
}

/// Retention bounds applied per partition
///
/// The default retains everything. Either bound may be set independently;
/// implementations always keep the newest event of a partition so that
/// sequence assignment stays monotonic across pruning and restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many events per partition
    pub max_events_per_partition: Option<u64>,

    /// Drop events older than this on `prune`
    #[serde(default, with = "opt_duration_millis")]
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    /// Retain everything
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Set the per-partition event count bound
    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events_per_partition = Some(max_events.max(1));
        self
    }

    /// Set the event age bound
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Whether any bound is configured
    pub fn is_bounded(&self) -> bool {
        self.max_events_per_partition.is_some() || self.max_age.is_some()
    }
}

/// Append-only, partitioned-by-task event log
///
/// The log is the source of truth for ordering and replay. Sequences are
/// 1-based and strictly increasing with no gaps per partition while the
/// events are retained. `append` must be serialized per partition (single
/// writer discipline); appends to different partitions may run concurrently.
///
/// Implementations must be thread-safe and preserve per-partition sequencing
/// across restarts.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append one event, durable before return
    ///
    /// Returns the assigned sequence. Fails with
    /// [`EventLogError::PartitionUnavailable`] when durability cannot be
    /// guaranteed; the caller must not assume the event exists.
    async fn append(
        &self,
        task_id: TaskId,
        kind: EventKind,
        payload: Vec<u8>,
    ) -> Result<u64, EventLogError>;

    /// Read up to `max` events with `sequence > after`, in sequence order
    ///
    /// Returns an empty vec (not an error) when `after` is at or past the
    /// head. Fails with [`EventLogError::RetentionGap`] when `after` falls
    /// below the retained floor, carrying the lowest retained sequence so
    /// callers can surface the gap instead of silently skipping events.
    /// Paging is restartable: pass the last returned sequence as `after`.
    async fn read(
        &self,
        task_id: TaskId,
        after: u64,
        max: usize,
    ) -> Result<Vec<TaskEvent>, EventLogError>;

    /// Latest assigned sequence for the partition, 0 if none
    async fn head(&self, task_id: TaskId) -> Result<u64, EventLogError>;

    /// Partitions currently known to the log
    ///
    /// Used to seed fanout for subscribers interested in all tasks.
    async fn partitions(&self) -> Result<Vec<TaskId>, EventLogError>;

    /// Apply the retention policy to one partition
    ///
    /// Returns the number of events dropped.
    async fn prune(&self, task_id: TaskId) -> Result<u64, EventLogError>;
}

/// Serde support for `Option<Duration>` as milliseconds
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
