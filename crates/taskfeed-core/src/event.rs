//! Task events and task identity

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a task, and therefore of its log partition.
///
/// Every task owns exactly one partition in the event log; all ordering
/// guarantees are scoped to a single `TaskId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new time-ordered task id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The kind of domain change a task event records
///
/// This is a closed set: the delivery core routes and orders events by kind
/// and partition but never looks inside the payload, so adding a kind is an
/// API change for producers and consumers, not for the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Task was created
    Created,

    /// Task fields were updated
    Updated,

    /// Task was assigned to a user
    Assigned,

    /// Task status transitioned
    StatusChanged,

    /// Task was deleted
    Deleted,
}

impl EventKind {
    /// Stable string form, matching the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Assigned => "assigned",
            Self::StatusChanged => "status_changed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown event kind string
#[derive(Debug, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct ParseEventKindError(pub String);

impl FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "assigned" => Ok(Self::Assigned),
            "status_changed" => Ok(Self::StatusChanged),
            "deleted" => Ok(Self::Deleted),
            other => Err(ParseEventKindError(other.to_string())),
        }
    }
}

/// One immutable record in a task's partition
///
/// Created exactly once by the publisher at append time and never mutated.
/// `sequence` is 1-based, strictly increasing, and gap-free within the
/// partition while the events are retained. Nothing relates sequences
/// across different tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Partition key
    pub task_id: TaskId,

    /// Position within the partition (1-based)
    pub sequence: u64,

    /// What changed
    pub kind: EventKind,

    /// Opaque payload; schema is agreed between producers and consumers
    pub payload: Vec<u8>,

    /// When the publisher appended the event
    pub produced_at: DateTime<Utc>,
}

impl TaskEvent {
    /// The idempotency key consumers deduplicate on
    pub fn idempotency_key(&self) -> (TaskId, u64) {
        (self.task_id, self.sequence)
    }
}
