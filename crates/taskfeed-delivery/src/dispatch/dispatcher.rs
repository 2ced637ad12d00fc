//! Fanout dispatcher
//!
//! Runs one delivery loop per (subscriber, partition) pair. Each loop first
//! reconciles the subscriber's backlog, then tails the partition head,
//! pushing events through the sequential-ack protocol. Loops park on a
//! per-partition head watch while at head (no busy polling) and are woken
//! by the publisher after each durable append.
//!
//! Failure containment is per loop: a stalled or broken sink delays only
//! its own (subscriber, partition) pair, and exhausting the retry ceiling
//! escalates to an operator-visible undeliverable report plus a forced
//! disconnect of that subscriber - never a dropped log event.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use taskfeed_core::{SubscriberId, TaskId};

use crate::log::EventLog;
use crate::reconcile::Reconciler;
use crate::registry::{DeliveryTicket, SubscriptionRegistry};

use super::delivery::{DeliveryError, SequentialDelivery};
use super::retry::DeliveryRetryPolicy;

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Backoff policy for failed sends and missed acks
    pub retry: DeliveryRetryPolicy,

    /// Bound on a single sink send
    #[serde(with = "duration_millis")]
    pub send_timeout: Duration,

    /// How long to wait for the subscriber's ack after a successful send
    #[serde(with = "duration_millis")]
    pub ack_timeout: Duration,

    /// Events per log read during replay and live tailing
    pub page_size: usize,

    /// Pause between retries when the log itself cannot serve reads
    #[serde(with = "duration_millis")]
    pub log_retry_interval: Duration,

    /// Cap on retained undeliverable reports (oldest dropped first)
    pub max_undeliverable_reports: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: DeliveryRetryPolicy::default(),
            send_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            page_size: 100,
            log_retry_interval: Duration::from_millis(500),
            max_undeliverable_reports: 1024,
        }
    }
}

impl DeliveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: DeliveryRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the sink send timeout
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the ack timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the read page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// An event that exhausted its retry ceiling for one subscriber
///
/// The event itself stays in the log; this record exists so operators can
/// see which subscriber failed to take it and why.
#[derive(Debug, Clone, Serialize)]
pub struct UndeliverableEvent {
    pub subscriber_id: SubscriberId,
    pub task_id: TaskId,
    pub sequence: u64,
    pub attempts: u32,
    pub last_error: String,
    pub reported_at: DateTime<Utc>,
}

/// Fanout engine: owns the delivery loops and the partition head watches
pub struct Dispatcher {
    log: Arc<dyn EventLog>,
    registry: Arc<SubscriptionRegistry>,
    config: DeliveryConfig,
    heads: DashMap<TaskId, watch::Sender<u64>>,
    /// Partitions that have seen at least one append this process
    ///
    /// Distinct from `heads`: a delivery loop may create a head watch for a
    /// named task before its first event exists, and that must not stop the
    /// first real append from fanning out loops to other subscribers.
    known_partitions: DashSet<TaskId>,
    tracker: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
    reports: Mutex<VecDeque<UndeliverableEvent>>,
}

impl Dispatcher {
    pub(crate) fn new(
        log: Arc<dyn EventLog>,
        registry: Arc<SubscriptionRegistry>,
        config: DeliveryConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            log,
            registry,
            config,
            heads: DashMap::new(),
            known_partitions: DashSet::new(),
            tracker: TaskTracker::new(),
            shutdown_tx,
            reports: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a durable append: advance the partition head watch (waking
    /// parked loops) and fan out loops if the partition is newly seen
    pub(crate) fn record_append(self: &Arc<Self>, task: TaskId, sequence: u64) {
        let newly_seen = self.known_partitions.insert(task);
        {
            let sender = self
                .heads
                .entry(task)
                .or_insert_with(|| watch::channel(sequence).0);
            sender.send_if_modified(|head| {
                if sequence > *head {
                    *head = sequence;
                    true
                } else {
                    false
                }
            });
        }

        if newly_seen {
            debug!(%task, "new partition");
            for ticket in self.registry.claim_for_partition(task) {
                self.spawn_loop(ticket);
            }
        }
    }

    /// Start delivery loops for a freshly connected subscriber
    ///
    /// Candidates are every partition the log knows plus every task the
    /// interest names explicitly (so a loop exists even before a named
    /// task's first event); the registry filters and claims atomically.
    pub(crate) async fn subscriber_connected(self: &Arc<Self>, id: &SubscriberId) {
        let mut candidates = match self.log.partitions().await {
            Ok(partitions) => partitions,
            Err(e) => {
                warn!(subscriber = %id, error = %e, "could not list partitions at connect");
                vec![]
            }
        };
        if let Some(interest) = self.registry.interest(id) {
            candidates.extend(interest.named_tasks().copied());
        }
        candidates.sort_unstable();
        candidates.dedup();

        for ticket in self.registry.claim_partitions_for(id, candidates) {
            self.spawn_loop(ticket);
        }
    }

    fn spawn_loop(self: &Arc<Self>, ticket: DeliveryTicket) {
        if self.tracker.is_closed() {
            return;
        }
        let dispatcher = Arc::clone(self);
        let head_rx = self.head_watch(ticket.task);
        self.tracker.spawn(async move {
            dispatcher.run_loop(ticket, head_rx).await;
        });
    }

    fn head_watch(&self, task: TaskId) -> watch::Receiver<u64> {
        self.heads
            .entry(task)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    #[instrument(
        skip(self, ticket, head_rx),
        fields(subscriber = %ticket.subscriber, task = %ticket.task, epoch = ticket.epoch)
    )]
    async fn run_loop(self: Arc<Self>, ticket: DeliveryTicket, head_rx: watch::Receiver<u64>) {
        let subscriber = ticket.subscriber.clone();
        let task = ticket.task;
        let epoch = ticket.epoch;

        let mut delivery = SequentialDelivery {
            ticket,
            root_shutdown: self.shutdown_tx.subscribe(),
            log: Arc::clone(&self.log),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        };

        match self.drive(&mut delivery, head_rx).await {
            Err(DeliveryError::Cancelled) => {
                debug!("delivery loop stopped");
            }
            Err(DeliveryError::Exhausted {
                sequence,
                attempts,
                last_error,
            }) => {
                self.report_undeliverable(&subscriber, task, sequence, attempts, last_error);
            }
            // drive() retries log failures internally and otherwise runs
            // until cancelled
            Err(DeliveryError::LogUnavailable(reason)) => {
                warn!(error = %reason, "delivery loop stopped on log failure");
            }
            Ok(()) => {}
        }

        self.registry.release_partition(&subscriber, task, epoch);
    }

    /// Reconcile, then tail the partition until cancelled
    async fn drive(
        &self,
        delivery: &mut SequentialDelivery,
        mut head_rx: watch::Receiver<u64>,
    ) -> Result<(), DeliveryError> {
        Reconciler::catch_up(delivery).await?;
        self.registry.mark_caught_up(
            &delivery.ticket.subscriber,
            delivery.ticket.task,
            delivery.ticket.epoch,
        );

        loop {
            match delivery.drain_once().await {
                Ok(0) => {
                    // At head: park until the publisher advances it
                    tokio::select! {
                        changed = head_rx.changed() => {
                            if changed.is_err() {
                                return Err(DeliveryError::Cancelled);
                            }
                        }
                        _ = delivery.cancelled() => return Err(DeliveryError::Cancelled),
                    }
                }
                Ok(_) => {}
                Err(DeliveryError::LogUnavailable(reason)) => {
                    warn!(
                        task = %delivery.ticket.task,
                        error = %reason,
                        "log read failed during live tailing"
                    );
                    delivery.pause_for_log().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn report_undeliverable(
        &self,
        subscriber: &SubscriberId,
        task: TaskId,
        sequence: u64,
        attempts: u32,
        last_error: String,
    ) {
        error!(
            subscriber = %subscriber,
            task = %task,
            sequence,
            attempts,
            error = %last_error,
            "event undeliverable; forcing disconnect"
        );

        {
            let mut reports = self.reports.lock();
            if reports.len() >= self.config.max_undeliverable_reports {
                reports.pop_front();
            }
            reports.push_back(UndeliverableEvent {
                subscriber_id: subscriber.clone(),
                task_id: task,
                sequence,
                attempts,
                last_error,
                reported_at: Utc::now(),
            });
        }

        // Force the subscriber through reconciliation on its next connect
        // rather than silently skipping the event
        let _ = self.registry.disconnect(subscriber);
    }

    /// Snapshot of undeliverable reports, oldest first
    pub fn undeliverable(&self) -> Vec<UndeliverableEvent> {
        self.reports.lock().iter().cloned().collect()
    }

    /// Stop every delivery loop and wait for them to exit
    pub(crate) async fn shutdown(&self) {
        info!("dispatcher shutting down");
        let _ = self.shutdown_tx.send(true);
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
