//! Fanout dispatch
//!
//! This module provides:
//! - [`Dispatcher`] - per-(subscriber, partition) delivery loops over the log
//! - [`EventSink`] - the contract the subscription-serving layer implements
//! - [`DeliveryRetryPolicy`] - jittered exponential backoff for failed sends
//! - [`DeliveryConfig`] - timeouts, paging, and report bounds
//!
//! # Architecture
//!
//! ```text
//! publisher append ──▶ partition head watch ──▶ wakes parked loops
//!
//! ┌──────────────── delivery loop (subscriber S, task T) ───────────────┐
//! │  reconcile: page log from cursor ──▶ sequential send+ack ──▶ caught │
//! │  live:      page log at head ──────▶ sequential send+ack ──▶ park   │
//! │  failure:   backoff ▶ resend ▶ ... ▶ undeliverable + disconnect     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Loops never share state beyond the registry cursor, so one slow sink
//! cannot stall another subscriber or another partition.

pub(crate) mod delivery;
mod dispatcher;
mod retry;
mod sink;

pub use dispatcher::{DeliveryConfig, Dispatcher, UndeliverableEvent};
pub use retry::DeliveryRetryPolicy;
pub use sink::{EventSink, SinkError};
