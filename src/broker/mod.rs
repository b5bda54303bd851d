//! Message transport between dispatchers and workers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::TaskResult;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// A message handed to a consumer, awaiting ack, nack or reject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag identifying this delivery
    pub tag: u64,
    /// Queue the message was consumed from
    pub queue: String,
    /// Opaque message body
    pub payload: Vec<u8>,
}

/// At-least-once message transport
///
/// A consumed message stays unacknowledged until the consumer calls
/// [`Broker::ack`], [`Broker::nack`] or [`Broker::reject`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make a message immediately available on `queue`
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> TaskResult<()>;

    /// Make a message available on `queue` once `eta` has passed
    async fn schedule(&self, queue: &str, payload: Vec<u8>, eta: DateTime<Utc>) -> TaskResult<()>;

    /// Wait up to `timeout` for the next message on `queue`
    async fn consume(&self, queue: &str, timeout: Duration) -> TaskResult<Option<Delivery>>;

    /// The delivery was fully handled
    async fn ack(&self, delivery: &Delivery) -> TaskResult<()>;

    /// Put the delivery back on its queue for redelivery
    async fn nack(&self, delivery: &Delivery) -> TaskResult<()>;

    /// Drop the delivery into the dead-letter list; it is never redelivered
    async fn reject(&self, delivery: &Delivery) -> TaskResult<()>;

    /// Move scheduled messages whose eta has passed onto `queue`
    async fn promote_due(&self, queue: &str) -> TaskResult<u64>;

    /// Put deliveries consumed from `queue` more than `older_than` ago and
    /// still unacknowledged back on the queue
    ///
    /// Covers consumers that died or were aborted while holding a message.
    async fn requeue_stale(&self, queue: &str, older_than: Duration) -> TaskResult<u64>;
}
