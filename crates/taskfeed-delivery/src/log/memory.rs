//! In-memory implementation of EventLog

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use taskfeed_core::{EventKind, TaskEvent, TaskId};

use super::store::{EventLog, EventLogError, RetentionPolicy};

/// One partition's retained buffer
///
/// `next_sequence` survives pruning so sequence assignment stays monotonic
/// even after the buffer drains completely.
struct PartitionBuf {
    next_sequence: u64,
    events: VecDeque<TaskEvent>,
}

impl PartitionBuf {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            events: VecDeque::new(),
        }
    }

    /// Latest assigned sequence, 0 if none yet
    fn head(&self) -> u64 {
        self.next_sequence - 1
    }
}

/// In-memory implementation of [`EventLog`]
///
/// The default backend for tests and single-process embedding. Each
/// partition is locked independently, so appends to different tasks do not
/// contend while appends within one task stay serialized.
///
/// # Example
///
/// ```
/// use taskfeed_delivery::log::InMemoryEventLog;
///
/// let log = InMemoryEventLog::new();
/// ```
pub struct InMemoryEventLog {
    partitions: DashMap<TaskId, PartitionBuf>,
    retention: RetentionPolicy,
}

impl InMemoryEventLog {
    /// Create an unbounded in-memory log
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::unbounded())
    }

    /// Create a log with the given retention policy
    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            partitions: DashMap::new(),
            retention,
        }
    }

    /// Number of partitions with at least one assigned sequence
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Total retained events across partitions
    pub fn retained_events(&self) -> usize {
        self.partitions.iter().map(|p| p.events.len()).sum()
    }

    /// Drop events that exceed the retention bounds; returns the count dropped
    fn enforce_retention(buf: &mut PartitionBuf, retention: &RetentionPolicy) -> u64 {
        let mut dropped = 0;

        if let Some(max_events) = retention.max_events_per_partition {
            while buf.events.len() as u64 > max_events {
                buf.events.pop_front();
                dropped += 1;
            }
        }

        if let Some(max_age) = retention.max_age {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
            while buf.events.front().is_some_and(|e| e.produced_at < cutoff) {
                buf.events.pop_front();
                dropped += 1;
            }
        }

        dropped
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        task_id: TaskId,
        kind: EventKind,
        payload: Vec<u8>,
    ) -> Result<u64, EventLogError> {
        let mut buf = self
            .partitions
            .entry(task_id)
            .or_insert_with(PartitionBuf::new);

        let sequence = buf.next_sequence;
        buf.next_sequence += 1;
        buf.events.push_back(TaskEvent {
            task_id,
            sequence,
            kind,
            payload,
            produced_at: Utc::now(),
        });

        Self::enforce_retention(&mut buf, &self.retention);

        Ok(sequence)
    }

    async fn read(
        &self,
        task_id: TaskId,
        after: u64,
        max: usize,
    ) -> Result<Vec<TaskEvent>, EventLogError> {
        let Some(buf) = self.partitions.get(&task_id) else {
            return Ok(vec![]);
        };

        if after >= buf.head() {
            return Ok(vec![]);
        }

        // Everything up to the head pruned: the floor collapses to the head,
        // and any reader behind it has a gap.
        let Some(front) = buf.events.front() else {
            return Err(EventLogError::RetentionGap {
                task_id,
                floor: buf.head(),
            });
        };
        if after + 1 < front.sequence {
            return Err(EventLogError::RetentionGap {
                task_id,
                floor: front.sequence,
            });
        }

        Ok(buf
            .events
            .iter()
            .filter(|e| e.sequence > after)
            .take(max)
            .cloned()
            .collect())
    }

    async fn head(&self, task_id: TaskId) -> Result<u64, EventLogError> {
        Ok(self
            .partitions
            .get(&task_id)
            .map(|b| b.head())
            .unwrap_or(0))
    }

    async fn partitions(&self) -> Result<Vec<TaskId>, EventLogError> {
        Ok(self.partitions.iter().map(|p| *p.key()).collect())
    }

    async fn prune(&self, task_id: TaskId) -> Result<u64, EventLogError> {
        let Some(mut buf) = self.partitions.get_mut(&task_id) else {
            return Ok(0);
        };
        Ok(Self::enforce_retention(&mut buf, &self.retention))
    }
}
