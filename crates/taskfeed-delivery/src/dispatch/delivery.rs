//! Sequential-ack delivery for one (subscriber, partition) pair
//!
//! At most one event is in flight per pair: the next sequence is not sent
//! until the current one is acknowledged or the retry ceiling is reached.
//! Both the reconciler (backlog replay) and the dispatcher (live tailing)
//! push through this path, so a subscriber can never observe reordering
//! within a partition.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use taskfeed_core::TaskEvent;

use crate::log::{EventLog, EventLogError};
use crate::registry::{DeliveryTicket, SubscriptionRegistry};

use super::dispatcher::DeliveryConfig;

/// Terminal outcomes of a delivery step
#[derive(Debug)]
pub(crate) enum DeliveryError {
    /// The connection (or the whole dispatcher) is shutting down
    Cancelled,

    /// Retry ceiling reached; the event is undeliverable on this connection
    Exhausted {
        sequence: u64,
        attempts: u32,
        last_error: String,
    },

    /// The log could not serve a read; the caller backs off and retries
    /// (never escalated to undeliverable - the sink is not at fault)
    LogUnavailable(String),
}

/// One in-flight or backing-off delivery; discarded on success or on
/// exceeding the retry ceiling
#[derive(Debug, Clone, Copy)]
struct DeliveryAttempt {
    sequence: u64,
    attempt_count: u32,
    next_retry_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    fn first(sequence: u64) -> Self {
        Self {
            sequence,
            attempt_count: 1,
            next_retry_at: Utc::now(),
        }
    }
}

/// Resolves when the flag flips true or the sender side is gone
async fn flagged(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The delivery half of one (subscriber, partition) loop
pub(crate) struct SequentialDelivery {
    pub(crate) ticket: DeliveryTicket,
    pub(crate) root_shutdown: watch::Receiver<bool>,
    pub(crate) log: Arc<dyn EventLog>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) config: DeliveryConfig,
}

impl SequentialDelivery {
    /// Current cursor; 0 when the subscriber has vanished (the loop will be
    /// cancelled promptly in that case)
    pub(crate) fn cursor(&self) -> u64 {
        self.registry
            .cursor(&self.ticket.subscriber, self.ticket.task)
            .unwrap_or(0)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.ticket.shutdown.borrow()
            || self.ticket.shutdown.has_changed().is_err()
            || *self.root_shutdown.borrow()
            || self.root_shutdown.has_changed().is_err()
    }

    /// Resolves when this loop should stop
    pub(crate) async fn cancelled(&mut self) {
        tokio::select! {
            _ = flagged(&mut self.ticket.shutdown) => {}
            _ = flagged(&mut self.root_shutdown) => {}
        }
    }

    /// Read one page after the cursor and deliver it sequentially
    ///
    /// Handles retention gaps by surfacing a missed-events notice and
    /// resetting the cursor to the floor. Returns how much progress was
    /// made; 0 means the partition is drained and the caller may park.
    pub(crate) async fn drain_once(&mut self) -> Result<usize, DeliveryError> {
        let cursor = self.cursor();
        let page = match self
            .log
            .read(self.ticket.task, cursor, self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(EventLogError::RetentionGap { floor, .. }) => {
                warn!(
                    subscriber = %self.ticket.subscriber,
                    task = %self.ticket.task,
                    cursor,
                    floor,
                    "backlog passed out of retention"
                );
                self.notify_missed(floor).await?;
                self.registry
                    .advance_cursor(&self.ticket.subscriber, self.ticket.task, floor);
                return Ok(1);
            }
            Err(e) => return Err(DeliveryError::LogUnavailable(e.to_string())),
        };

        let count = page.len();
        for event in &page {
            self.deliver(event).await?;
        }
        Ok(count)
    }

    /// Deliver one event: send, await the subscriber's ack, retry with
    /// backoff on failure up to the ceiling
    pub(crate) async fn deliver(&mut self, event: &TaskEvent) -> Result<(), DeliveryError> {
        let mut attempt = DeliveryAttempt::first(event.sequence);

        loop {
            if self.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            let failure = match self.try_send(event).await? {
                Ok(()) => match self.await_ack(event.sequence).await? {
                    true => {
                        trace!(
                            subscriber = %self.ticket.subscriber,
                            task = %self.ticket.task,
                            sequence = event.sequence,
                            "delivered"
                        );
                        return Ok(());
                    }
                    false => "acknowledgment timed out".to_string(),
                },
                Err(reason) => reason,
            };

            warn!(
                subscriber = %self.ticket.subscriber,
                task = %self.ticket.task,
                sequence = event.sequence,
                attempt = attempt.attempt_count,
                error = %failure,
                "delivery attempt failed"
            );

            attempt = self.next_attempt_or_exhaust(attempt, failure)?;
            self.backoff(attempt).await?;
        }
    }

    /// Push a missed-events notice through the sink with the same retry
    /// discipline as event delivery (no ack is awaited for notices)
    async fn notify_missed(&mut self, floor: u64) -> Result<(), DeliveryError> {
        let mut attempt = DeliveryAttempt::first(floor);

        loop {
            if self.is_cancelled() {
                return Err(DeliveryError::Cancelled);
            }

            match self.try_notify(floor).await? {
                Ok(()) => {
                    debug!(
                        subscriber = %self.ticket.subscriber,
                        task = %self.ticket.task,
                        floor,
                        "missed-events notice delivered"
                    );
                    return Ok(());
                }
                Err(reason) => {
                    attempt = self.next_attempt_or_exhaust(attempt, reason)?;
                    self.backoff(attempt).await?;
                }
            }
        }
    }

    /// One bounded send; `Ok(Err(reason))` is a retryable failure
    async fn try_send(&mut self, event: &TaskEvent) -> Result<Result<(), String>, DeliveryError> {
        let sink = Arc::clone(&self.ticket.sink);
        let send_timeout = self.config.send_timeout;
        let send = async move { tokio::time::timeout(send_timeout, sink.send(event)).await };

        tokio::select! {
            res = send => Ok(match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("send timed out".to_string()),
            }),
            _ = self.cancelled() => Err(DeliveryError::Cancelled),
        }
    }

    async fn try_notify(&mut self, floor: u64) -> Result<Result<(), String>, DeliveryError> {
        let sink = Arc::clone(&self.ticket.sink);
        let task = self.ticket.task;
        let send_timeout = self.config.send_timeout;
        let send = async move { tokio::time::timeout(send_timeout, sink.notify_missed(task, floor)).await };

        tokio::select! {
            res = send => Ok(match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("send timed out".to_string()),
            }),
            _ = self.cancelled() => Err(DeliveryError::Cancelled),
        }
    }

    /// Park until the cursor passes `sequence`; false on ack timeout
    async fn await_ack(&mut self, sequence: u64) -> Result<bool, DeliveryError> {
        let wait = {
            let registry = Arc::clone(&self.registry);
            let subscriber = self.ticket.subscriber.clone();
            let task = self.ticket.task;
            let ack_timeout = self.config.ack_timeout;
            async move {
                registry
                    .wait_for_ack(&subscriber, task, sequence, ack_timeout)
                    .await
            }
        };

        tokio::select! {
            acked = wait => Ok(acked),
            _ = self.cancelled() => Err(DeliveryError::Cancelled),
        }
    }

    fn next_attempt_or_exhaust(
        &self,
        attempt: DeliveryAttempt,
        last_error: String,
    ) -> Result<DeliveryAttempt, DeliveryError> {
        if !self.config.retry.has_attempts_remaining(attempt.attempt_count) {
            return Err(DeliveryError::Exhausted {
                sequence: attempt.sequence,
                attempts: attempt.attempt_count,
                last_error,
            });
        }

        let attempt_count = attempt.attempt_count + 1;
        let delay = self.config.retry.delay_for_attempt(attempt_count);
        Ok(DeliveryAttempt {
            sequence: attempt.sequence,
            attempt_count,
            next_retry_at: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
        })
    }

    /// Park briefly after a failed log read, or bail on cancellation
    pub(crate) async fn pause_for_log(&mut self) -> Result<(), DeliveryError> {
        let interval = self.config.log_retry_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => Ok(()),
            _ = self.cancelled() => Err(DeliveryError::Cancelled),
        }
    }

    /// Park until the attempt's retry time, or bail on cancellation
    async fn backoff(&mut self, attempt: DeliveryAttempt) -> Result<(), DeliveryError> {
        trace!(
            subscriber = %self.ticket.subscriber,
            task = %self.ticket.task,
            sequence = attempt.sequence,
            next_retry_at = %attempt.next_retry_at,
            "backing off"
        );

        let delay = (attempt.next_retry_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancelled() => Err(DeliveryError::Cancelled),
        }
    }
}
