//! # Notification Delivery Core
//!
//! Event-driven delivery of task notifications with durable ordering:
//!
//! - **Durable ordering**: every task owns an append-only log partition;
//!   events are delivered in strict per-partition sequence order
//! - **Write-ahead publishing**: a task mutation is not complete until its
//!   event is durably appended and acknowledged
//! - **At-least-once fanout**: sequential send+ack per (subscriber,
//!   partition), jittered exponential retry, undeliverable escalation
//! - **Reconciliation**: persistent cursors let a reconnecting subscriber
//!   replay exactly what it missed before live tailing resumes
//! - **Explicit gaps**: backlog pruned out of retention surfaces as a
//!   missed-events notice, never as silent loss
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EventPublisher                         │
//! │   (durable append, ack to the mutation path, head wake-up)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EventLog                             │
//! │   (per-task partitions: in-memory or PostgreSQL backend)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Dispatcher + Reconciler                       │
//! │  (one loop per subscriber×partition: replay, then live      │
//! │   tailing; cursors in the SubscriptionRegistry)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskfeed_core::{EventKind, Interest, SubscriberId};
//! use taskfeed_delivery::prelude::*;
//!
//! let hub = NotificationHub::in_memory(DeliveryConfig::default());
//!
//! let viewer = SubscriberId::from("session-1");
//! hub.subscribe(viewer.clone(), Interest::All);
//! hub.connect(&viewer, Arc::new(gateway_sink)).await?;
//!
//! let ack = hub.publish(task_id, EventKind::StatusChanged, payload).await?;
//! // the gateway acks as the client consumes:
//! hub.ack(&viewer, task_id, ack.sequence);
//! ```

pub mod dispatch;
pub mod hub;
pub mod log;
pub mod publish;
pub mod reconcile;
pub mod registry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::dispatch::{
        DeliveryConfig, DeliveryRetryPolicy, EventSink, SinkError, UndeliverableEvent,
    };
    pub use crate::hub::NotificationHub;
    pub use crate::log::{EventLog, EventLogError, InMemoryEventLog, PostgresEventLog, RetentionPolicy};
    pub use crate::publish::{EventPublisher, PublishAck, PublishError};
    pub use crate::registry::{RegistryError, SubscriptionRegistry};
}

// Re-export key types at crate root
pub use dispatch::{DeliveryConfig, DeliveryRetryPolicy, EventSink, SinkError, UndeliverableEvent};
pub use hub::NotificationHub;
pub use log::{EventLog, EventLogError, InMemoryEventLog, PostgresEventLog, RetentionPolicy};
pub use publish::{EventPublisher, PublishAck, PublishError};
pub use reconcile::Reconciler;
pub use registry::{RegistryError, SubscriptionRegistry};
