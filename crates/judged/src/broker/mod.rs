//! Message broker interface
//!
//! Tasks are delivered with at-least-once semantics. Each delivery is settled
//! exactly once, by [`Broker::ack`] or [`Broker::reject`]; the broker stops
//! handing out deliveries while the number of unsettled ones reaches the
//! prefetch limit.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::broker::memory::MemoryBroker;
pub use crate::broker::spool::SpoolBroker;

mod memory;
mod spool;

/// Identifies one delivery until it is settled
pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    /// How many times this message has been delivered, including this one
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    /// Limit the number of unsettled deliveries; 0 means unlimited
    async fn set_prefetch(&self, count: u32) -> Result<(), BrokerError>;

    /// Wait for the next task.
    ///
    /// Returns `None` once the broker will never deliver again. Must be
    /// cancel-safe: dropping the future never loses a message.
    async fn next_delivery(&self) -> Result<Option<Delivery>, BrokerError>;

    /// Publish a result message
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Settle a delivery as done
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Settle a delivery as failed.
    ///
    /// With `requeue` the message is redelivered later unless it has reached the
    /// delivery limit, in which case it is dead-lettered; without it the message
    /// is dead-lettered immediately.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}
