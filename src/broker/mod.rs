//! Publish-subscribe broker capability.
//!
//! The pipeline only needs two things from a broker: publish a payload to a
//! stream, and fetch the next payload delivered to a consumer group. Both
//! loops are written against [`MessageSource`] / [`MessageSink`] so they can
//! run against Redis Streams in production and an in-process topic in tests.

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_streams;

pub use memory::{MemoryConsumer, MemoryPublisher, MemoryTopic};
pub use redis_streams::{RedisStreamConsumer, RedisStreamPublisher};

// ---

/// Errors surfaced by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Redis command failed or the connection dropped.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A delivered entry did not carry a payload field.
    #[error("message {0} has no payload")]
    MissingPayload(String),

    /// The in-process topic has been closed.
    #[error("topic closed")]
    Closed,
}

/// Consumer side of a stream, bound to one consumer group.
///
/// `fetch` waits until a message is delivered; callers bound it with a
/// timeout and treat expiry as a transient failure. Implementations must be
/// cancel-safe: dropping an unfinished `fetch` never loses a message, which
/// is returned by a later call instead.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>, BrokerError>;
}

/// Producer side of a stream.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError>;
}
