//! Event publisher
//!
//! The only write path into the log. The task-mutation service calls
//! [`EventPublisher::publish`] synchronously on its commit path and must not
//! consider a mutation complete until the ack returns: no event exists
//! without a durable append, and no acknowledged mutation lacks its event.

use std::sync::Arc;

use tracing::{debug, instrument};

use taskfeed_core::{EventKind, TaskId};

use crate::dispatch::Dispatcher;
use crate::log::{EventLog, EventLogError};

/// Error type for publish operations
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The append was not durably persisted; the event must be assumed
    /// absent. Retry or abort of the originating mutation belongs to the
    /// caller - the publisher never retries, so a double-invoked mutation
    /// cannot double-publish.
    #[error("event not durably appended for task {task_id}: {source}")]
    PartitionUnavailable {
        task_id: TaskId,
        #[source]
        source: EventLogError,
    },
}

/// Acknowledgment of a durable append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub task_id: TaskId,
    pub sequence: u64,
}

/// Accepts domain events from the mutation path and appends them to the log
pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    dispatcher: Arc<Dispatcher>,
}

impl EventPublisher {
    pub(crate) fn new(log: Arc<dyn EventLog>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { log, dispatcher }
    }

    /// Append one event, acknowledging only after it is durable
    ///
    /// On success the partition's delivery loops are woken; failures
    /// propagate synchronously so the mutation path can abort.
    #[instrument(skip(self, payload), fields(%task_id, %kind))]
    pub async fn publish(
        &self,
        task_id: TaskId,
        kind: EventKind,
        payload: Vec<u8>,
    ) -> Result<PublishAck, PublishError> {
        let sequence = self
            .log
            .append(task_id, kind, payload)
            .await
            .map_err(|source| PublishError::PartitionUnavailable { task_id, source })?;

        self.dispatcher.record_append(task_id, sequence);

        debug!(%task_id, sequence, "published event");
        Ok(PublishAck { task_id, sequence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DeliveryConfig;
    use crate::log::InMemoryEventLog;
    use crate::registry::SubscriptionRegistry;
    use async_trait::async_trait;
    use taskfeed_core::TaskEvent;

    /// A log whose durability is gone
    struct FailingLog;

    #[async_trait]
    impl EventLog for FailingLog {
        async fn append(
            &self,
            task_id: TaskId,
            _kind: EventKind,
            _payload: Vec<u8>,
        ) -> Result<u64, EventLogError> {
            Err(EventLogError::PartitionUnavailable {
                task_id,
                reason: "disk full".to_string(),
            })
        }

        async fn read(
            &self,
            _task_id: TaskId,
            _after: u64,
            _max: usize,
        ) -> Result<Vec<TaskEvent>, EventLogError> {
            Ok(vec![])
        }

        async fn head(&self, _task_id: TaskId) -> Result<u64, EventLogError> {
            Ok(0)
        }

        async fn partitions(&self) -> Result<Vec<TaskId>, EventLogError> {
            Ok(vec![])
        }

        async fn prune(&self, _task_id: TaskId) -> Result<u64, EventLogError> {
            Ok(0)
        }
    }

    fn publisher_over(log: Arc<dyn EventLog>) -> EventPublisher {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&log),
            registry,
            DeliveryConfig::default(),
        ));
        EventPublisher::new(log, dispatcher)
    }

    #[tokio::test]
    async fn test_publish_acks_with_assigned_sequence() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
        let publisher = publisher_over(Arc::clone(&log));
        let task = TaskId::new();

        let first = publisher
            .publish(task, EventKind::Created, b"{}".to_vec())
            .await
            .unwrap();
        let second = publisher
            .publish(task, EventKind::Updated, b"{}".to_vec())
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(log.head(task).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_publish_failure_propagates_to_caller() {
        let publisher = publisher_over(Arc::new(FailingLog));

        let err = publisher
            .publish(TaskId::new(), EventKind::Created, vec![])
            .await
            .unwrap_err();
        let PublishError::PartitionUnavailable { source, .. } = err;
        assert!(matches!(
            source,
            EventLogError::PartitionUnavailable { .. }
        ));
    }
}
