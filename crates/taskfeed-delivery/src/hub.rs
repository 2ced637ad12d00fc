//! Hub assembly
//!
//! Wires the log, registry, dispatcher, and publisher into one handle. The
//! embedding service holds a [`NotificationHub`] and exposes its surface to
//! the two external collaborators: the task-mutation path (publish) and the
//! subscription-serving layer (subscribe/connect/disconnect/ack).

use std::sync::Arc;

use taskfeed_core::{EventKind, Interest, SubscriberId, TaskId};

use crate::dispatch::{DeliveryConfig, Dispatcher, EventSink, UndeliverableEvent};
use crate::log::{EventLog, InMemoryEventLog};
use crate::publish::{EventPublisher, PublishAck, PublishError};
use crate::registry::{RegistryError, SubscriptionRegistry};

/// The assembled notification delivery core
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use taskfeed_core::{EventKind, Interest, SubscriberId, TaskId};
/// use taskfeed_delivery::{DeliveryConfig, NotificationHub};
///
/// let hub = NotificationHub::in_memory(DeliveryConfig::default());
///
/// let subscriber = SubscriberId::from("session-1");
/// hub.subscribe(subscriber.clone(), Interest::All);
/// hub.connect(&subscriber, Arc::new(my_sink)).await?;
///
/// // Mutation path:
/// hub.publish(task_id, EventKind::Updated, payload).await?;
///
/// // Transport acks flow back:
/// hub.ack(&subscriber, task_id, 1);
/// ```
pub struct NotificationHub {
    log: Arc<dyn EventLog>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    publisher: EventPublisher,
}

impl NotificationHub {
    /// Assemble a hub over the given log
    pub fn new(log: Arc<dyn EventLog>, config: DeliveryConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&log),
            Arc::clone(&registry),
            config,
        ));
        let publisher = EventPublisher::new(Arc::clone(&log), Arc::clone(&dispatcher));

        Self {
            log,
            registry,
            dispatcher,
            publisher,
        }
    }

    /// Assemble a hub over a fresh unbounded in-memory log
    pub fn in_memory(config: DeliveryConfig) -> Self {
        Self::new(Arc::new(InMemoryEventLog::new()), config)
    }

    // =========================================================================
    // Mutation-path surface
    // =========================================================================

    /// Publish one task event; see [`EventPublisher::publish`]
    pub async fn publish(
        &self,
        task_id: TaskId,
        kind: EventKind,
        payload: Vec<u8>,
    ) -> Result<PublishAck, PublishError> {
        self.publisher.publish(task_id, kind, payload).await
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    // =========================================================================
    // Subscription-serving surface
    // =========================================================================

    /// Create or update a subscription; idempotent, never resets cursors
    pub fn subscribe(&self, id: SubscriberId, interest: Interest) {
        self.registry.subscribe(id, interest);
    }

    /// Attach a live sink and start reconcile-then-live delivery loops
    ///
    /// Backlog replay for every matching partition happens before any live
    /// push reaches this subscriber.
    pub async fn connect(
        &self,
        id: &SubscriberId,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), RegistryError> {
        self.registry.connect(id, sink)?;
        self.dispatcher.subscriber_connected(id).await;
        Ok(())
    }

    /// Detach the sink; cursors survive for the next reconnect
    pub fn disconnect(&self, id: &SubscriberId) -> Result<(), RegistryError> {
        self.registry.disconnect(id)
    }

    /// Acknowledge delivery up to `sequence` on one partition
    pub fn ack(&self, id: &SubscriberId, task: TaskId, sequence: u64) {
        self.registry.ack(id, task, sequence);
    }

    /// Remove the subscription and stop its delivery promptly
    pub fn unsubscribe(&self, id: &SubscriberId) -> Result<(), RegistryError> {
        self.registry.unsubscribe(id)
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// A subscriber's last-acknowledged sequence for a partition
    pub fn cursor(&self, id: &SubscriberId, task: TaskId) -> Option<u64> {
        self.registry.cursor(id, task)
    }

    pub fn is_connected(&self, id: &SubscriberId) -> bool {
        self.registry.is_connected(id)
    }

    /// Whether backlog replay has completed for a partition on the current
    /// connection
    pub fn is_caught_up(&self, id: &SubscriberId, task: TaskId) -> bool {
        self.registry.is_caught_up(id, task)
    }

    /// Operator-visible undeliverable reports, oldest first
    pub fn undeliverable(&self) -> Vec<UndeliverableEvent> {
        self.dispatcher.undeliverable()
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop all delivery loops and wait for them to exit
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
