//! Clients for the external coordination store: an atomic integer counter and
//! a publish/subscribe bus.

pub mod memory;
pub mod redis;
pub mod retry;

use {
    crate::{
        channel::{BusEvent, Channel},
        metrics::BUS_DECODE_FAILURES,
    },
    async_trait::async_trait,
    futures::stream::BoxStream,
    log::warn,
    thiserror::Error,
};

pub use {memory::MemoryStore, redis::RedisStore, retry::RetryPolicy};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("value {value:?} at {key} is not an integer")]
    Malformed { key: String, value: String },
}

/// Decoded bus traffic, in delivery order.
pub type BusStream = BoxStream<'static, BusEvent>;

/// Atomic operations on a single integer value shared by every instance.
#[async_trait]
pub trait SharedCounter: Send + Sync {
    /// Sets `key` to 0 if and only if it is absent. Returns `true` when this
    /// call created the value.
    async fn ensure_initialized(&self, key: &str) -> Result<bool, StoreError>;

    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// May go below zero if the shared value has drifted.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError>;
}

/// Publish/subscribe signaling between instances.
///
/// Delivery is at-most-once with no replay. A subscriber receives the
/// messages it published itself on every channel it is subscribed to; the
/// relay depends on this for delivering a sender's message back to its own
/// instance.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, event: &BusEvent) -> Result<(), StoreError>;

    async fn subscribe(&self, channels: &[Channel]) -> Result<BusStream, StoreError>;
}

pub(crate) fn decode_or_log(channel: &str, payload: &str) -> Option<BusEvent> {
    match BusEvent::decode(channel, payload) {
        Ok(event) => Some(event),
        Err(error) => {
            BUS_DECODE_FAILURES.inc();
            warn!("Dropping bus message: {error}");
            None
        }
    }
}
