//! Subscription registry
//!
//! The process-wide authority for subscriber state: interest, per-partition
//! cursors, and connection lifecycle. Records are created by an explicit
//! `subscribe` and destroyed only by `unsubscribe`; cursors survive
//! disconnection, which is what makes replay possible.
//!
//! Operations on the same subscriber are linearizable (each takes that
//! subscriber's map entry lock); different subscribers never contend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use taskfeed_core::{Interest, SubscriberId, TaskId};

use crate::dispatch::EventSink;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Operation referenced a subscriber that was never subscribed (or has
    /// been removed). `ack` is exempt: its idempotent no-op semantics take
    /// precedence for already-removed ids.
    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(SubscriberId),
}

/// Connection half of a subscriber record
enum ConnectionState {
    Disconnected,
    Connected {
        sink: Arc<dyn EventSink>,
        epoch: u64,
        /// Flipped to true to stop this connection's delivery loops
        shutdown: watch::Sender<bool>,
        /// Partitions whose backlog replay has completed this connection
        caught_up: HashSet<TaskId>,
        /// Partitions with a delivery loop claimed this connection
        active_loops: HashSet<TaskId>,
    },
}

struct SubscriberState {
    interest: Interest,
    /// Last-acknowledged sequence per partition; watch senders so delivery
    /// loops can park until the cursor passes a sequence
    cursors: HashMap<TaskId, watch::Sender<u64>>,
    connection: ConnectionState,
}

/// Everything a delivery loop needs, claimed atomically from the registry
///
/// A ticket exists for at most one loop per (subscriber, partition) per
/// connection epoch; the claim is released when the loop exits.
#[derive(Clone)]
pub(crate) struct DeliveryTicket {
    pub subscriber: SubscriberId,
    pub task: TaskId,
    pub epoch: u64,
    pub sink: Arc<dyn EventSink>,
    pub shutdown: watch::Receiver<bool>,
}

/// Process-wide subscriber state authority
pub struct SubscriptionRegistry {
    subscribers: DashMap<SubscriberId, SubscriberState>,
    epoch_counter: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            epoch_counter: AtomicU64::new(1),
        }
    }

    /// Create or update a subscription; idempotent
    ///
    /// Re-subscribing with the same id updates the interest without touching
    /// cursors or connection state.
    pub fn subscribe(&self, id: SubscriberId, interest: Interest) {
        match self.subscribers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.get_mut().interest = interest;
                debug!(subscriber = %id, "updated subscription interest");
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(SubscriberState {
                    interest,
                    cursors: HashMap::new(),
                    connection: ConnectionState::Disconnected,
                });
                info!(subscriber = %id, "subscribed");
            }
        }
    }

    /// Attach a live sink, starting a fresh connection epoch
    ///
    /// Any previous connection's loops are told to stop first, so a stale
    /// loop can never deliver on the new connection. The caller must run
    /// reconciliation before live delivery reaches this subscriber.
    pub fn connect(
        &self,
        id: &SubscriberId,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .subscribers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSubscriber(id.clone()))?;

        if let ConnectionState::Connected { shutdown, .. } = &entry.connection {
            let _ = shutdown.send(true);
        }

        let epoch = self.epoch_counter.fetch_add(1, Ordering::Relaxed);
        let (shutdown, _) = watch::channel(false);
        entry.connection = ConnectionState::Connected {
            sink,
            epoch,
            shutdown,
            caught_up: HashSet::new(),
            active_loops: HashSet::new(),
        };

        info!(subscriber = %id, epoch, "connected");
        Ok(())
    }

    /// Detach the sink; cursors are retained unchanged
    pub fn disconnect(&self, id: &SubscriberId) -> Result<(), RegistryError> {
        let mut entry = self
            .subscribers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSubscriber(id.clone()))?;

        if let ConnectionState::Connected { shutdown, .. } = &entry.connection {
            let _ = shutdown.send(true);
            info!(subscriber = %id, "disconnected");
        }
        entry.connection = ConnectionState::Disconnected;
        Ok(())
    }

    /// Remove the record entirely and stop all of its delivery loops
    pub fn unsubscribe(&self, id: &SubscriberId) -> Result<(), RegistryError> {
        let (_, state) = self
            .subscribers
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownSubscriber(id.clone()))?;

        if let ConnectionState::Connected { shutdown, .. } = &state.connection {
            let _ = shutdown.send(true);
        }
        info!(subscriber = %id, "unsubscribed");
        Ok(())
    }

    /// Advance the cursor after the subscriber acknowledged `sequence`
    ///
    /// Monotonic: a lower or equal sequence is a no-op, never an error;
    /// out-of-order acks from network reordering must not corrupt state.
    /// Unknown subscribers are ignored for the same reason (the ack may
    /// arrive after an unsubscribe).
    pub fn ack(&self, id: &SubscriberId, task: TaskId, sequence: u64) {
        trace!(subscriber = %id, %task, sequence, "ack");
        self.advance_cursor(id, task, sequence);
    }

    /// Monotonic cursor advance; also used for retention-floor resets
    pub(crate) fn advance_cursor(&self, id: &SubscriberId, task: TaskId, sequence: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(id) {
            let tx = entry
                .cursors
                .entry(task)
                .or_insert_with(|| watch::channel(0).0);
            tx.send_if_modified(|cursor| {
                if sequence > *cursor {
                    *cursor = sequence;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Last-acknowledged sequence for a partition; None if unknown subscriber
    pub fn cursor(&self, id: &SubscriberId, task: TaskId) -> Option<u64> {
        let entry = self.subscribers.get(id)?;
        Some(entry.cursors.get(&task).map(|tx| *tx.borrow()).unwrap_or(0))
    }

    /// Park until the cursor reaches `sequence` or the timeout elapses
    ///
    /// Returns false on timeout or if the subscriber disappears while
    /// waiting.
    pub(crate) async fn wait_for_ack(
        &self,
        id: &SubscriberId,
        task: TaskId,
        sequence: u64,
        timeout: Duration,
    ) -> bool {
        let mut rx = {
            let Some(mut entry) = self.subscribers.get_mut(id) else {
                return false;
            };
            entry
                .cursors
                .entry(task)
                .or_insert_with(|| watch::channel(0).0)
                .subscribe()
        };

        let result = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|cursor| *cursor >= sequence)).await,
            Ok(Ok(_))
        );
        result
    }

    pub fn interest(&self, id: &SubscriberId) -> Option<Interest> {
        self.subscribers.get(id).map(|e| e.interest.clone())
    }

    pub fn is_connected(&self, id: &SubscriberId) -> bool {
        self.subscribers
            .get(id)
            .map(|e| matches!(e.connection, ConnectionState::Connected { .. }))
            .unwrap_or(false)
    }

    /// Has backlog replay completed for this partition on the current
    /// connection?
    pub fn is_caught_up(&self, id: &SubscriberId, task: TaskId) -> bool {
        self.subscribers
            .get(id)
            .map(|e| match &e.connection {
                ConnectionState::Connected { caught_up, .. } => caught_up.contains(&task),
                ConnectionState::Disconnected => false,
            })
            .unwrap_or(false)
    }

    /// Record that replay finished; live pushes may now reach the partition
    pub(crate) fn mark_caught_up(&self, id: &SubscriberId, task: TaskId, epoch: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(id) {
            if let ConnectionState::Connected {
                epoch: current,
                caught_up,
                ..
            } = &mut entry.connection
            {
                if *current == epoch {
                    caught_up.insert(task);
                }
            }
        }
    }

    /// Release a loop claim when a delivery loop exits
    pub(crate) fn release_partition(&self, id: &SubscriberId, task: TaskId, epoch: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(id) {
            if let ConnectionState::Connected {
                epoch: current,
                caught_up,
                active_loops,
                ..
            } = &mut entry.connection
            {
                if *current == epoch {
                    active_loops.remove(&task);
                    caught_up.remove(&task);
                }
            }
        }
    }

    /// Claim delivery loops for one subscriber over candidate partitions
    ///
    /// Filters to partitions the interest covers that have no loop yet on
    /// the current connection. Returns one ticket per claimed partition.
    pub(crate) fn claim_partitions_for(
        &self,
        id: &SubscriberId,
        candidates: impl IntoIterator<Item = TaskId>,
    ) -> Vec<DeliveryTicket> {
        let Some(mut entry) = self.subscribers.get_mut(id) else {
            return vec![];
        };
        let state = &mut *entry;

        let ConnectionState::Connected {
            sink,
            epoch,
            shutdown,
            active_loops,
            ..
        } = &mut state.connection
        else {
            return vec![];
        };

        let mut tickets = vec![];
        for task in candidates {
            if state.interest.matches(&task) && active_loops.insert(task) {
                tickets.push(DeliveryTicket {
                    subscriber: id.clone(),
                    task,
                    epoch: *epoch,
                    sink: Arc::clone(sink),
                    shutdown: shutdown.subscribe(),
                });
            }
        }
        tickets
    }

    /// Claim delivery loops on every connected, interested subscriber for a
    /// newly seen partition
    pub(crate) fn claim_for_partition(&self, task: TaskId) -> Vec<DeliveryTicket> {
        let mut tickets = vec![];
        for mut entry in self.subscribers.iter_mut() {
            let id = entry.key().clone();
            let state = &mut *entry;

            let ConnectionState::Connected {
                sink,
                epoch,
                shutdown,
                active_loops,
                ..
            } = &mut state.connection
            else {
                continue;
            };

            if state.interest.matches(&task) && active_loops.insert(task) {
                tickets.push(DeliveryTicket {
                    subscriber: id,
                    task,
                    epoch: *epoch,
                    sink: Arc::clone(sink),
                    shutdown: shutdown.subscribe(),
                });
            }
        }
        tickets
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
