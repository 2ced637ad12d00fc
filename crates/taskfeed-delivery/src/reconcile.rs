//! Reconciliation of a reconnecting subscriber with the durable log
//!
//! On (re)connection a subscriber's persisted cursor usually trails the log.
//! The reconciler replays the gap - paging reads from the cursor up to the
//! head observed when the delivery loop started - through the same
//! sequential-ack protocol as live dispatch, so replayed and live events
//! form one strictly ordered stream per partition. Only after full catch-up
//! does the loop switch to live tailing; the dispatcher never pushes live
//! events to a partition the reconciler has not marked caught up.
//!
//! If the backlog has passed out of retention the replay cannot be
//! completed silently: the subscriber receives a missed-events notice
//! carrying the retained floor and its cursor is reset to that floor, an
//! explicit, observable data-loss acknowledgment.

use tracing::{debug, info, warn};

use crate::dispatch::delivery::{DeliveryError, SequentialDelivery};

/// Replays a subscriber's backlog before live tailing begins
///
/// Driven by the dispatcher at the start of every (subscriber, partition)
/// delivery loop; stateless between invocations (the cursor in the registry
/// is the only resume point).
pub struct Reconciler;

impl Reconciler {
    /// Page through the backlog until the cursor reaches the head observed
    /// at loop start
    ///
    /// Events appended while replay is in progress are picked up by the
    /// live phase immediately afterwards; the target is deliberately the
    /// head at connect time so catch-up terminates even under a steady
    /// stream of new appends.
    pub(crate) async fn catch_up(delivery: &mut SequentialDelivery) -> Result<(), DeliveryError> {
        let target = Self::observed_head(delivery).await?;
        let cursor = delivery.cursor();

        if cursor >= target {
            debug!(
                subscriber = %delivery.ticket.subscriber,
                task = %delivery.ticket.task,
                cursor,
                "no backlog to replay"
            );
            return Ok(());
        }

        info!(
            subscriber = %delivery.ticket.subscriber,
            task = %delivery.ticket.task,
            cursor,
            target,
            "replaying backlog"
        );

        while delivery.cursor() < target {
            match delivery.drain_once().await {
                // The log shrank below the target (retention pruned the
                // tail we were replaying towards); nothing left to do
                Ok(0) => break,
                Ok(_) => {}
                Err(DeliveryError::LogUnavailable(reason)) => {
                    warn!(
                        task = %delivery.ticket.task,
                        error = %reason,
                        "log read failed during replay"
                    );
                    delivery.pause_for_log().await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            subscriber = %delivery.ticket.subscriber,
            task = %delivery.ticket.task,
            cursor = delivery.cursor(),
            "backlog replay complete"
        );
        Ok(())
    }

    async fn observed_head(delivery: &mut SequentialDelivery) -> Result<u64, DeliveryError> {
        loop {
            match delivery.log.head(delivery.ticket.task).await {
                Ok(head) => return Ok(head),
                Err(e) => {
                    warn!(
                        task = %delivery.ticket.task,
                        error = %e,
                        "log head unavailable at connect"
                    );
                    delivery.pause_for_log().await?;
                }
            }
        }
    }
}
