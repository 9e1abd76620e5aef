//! Task queue: durable, at-least-once delivery of dispatch messages.
//!
//! A dequeued delivery is leased: invisible to other consumers until the
//! lease expires or the consumer acknowledges it. An unacknowledged delivery
//! is handed out again after the lease window, with its redelivery count
//! incremented. Consumers use that count to tell a crashed-worker takeover
//! apart from a concurrent duplicate. The lease must exceed the worker's
//! hard execution deadline so double-execution cannot happen in normal
//! operation.

pub mod in_memory;
pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;

use finsight_core::DispatchMessage;

pub use in_memory::InMemoryQueue;
pub use redis_streams::RedisStreamsQueue;

/// Queue-level error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker cannot be reached. The submission path surfaces this as a
    /// retryable condition and compensates the job row.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue command failed: {0}")]
    Backend(String),

    #[error("message codec error: {0}")]
    Codec(String),
}

/// A leased dispatch message handed to one consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: DispatchMessage,
    /// Broker receipt, passed back on `ack`.
    pub receipt: String,
    /// 0 on first delivery; >0 when a prior lease expired unacknowledged.
    pub redeliveries: u32,
}

/// At-least-once dispatch channel between the submission path and workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append a message. Never fails silently: an unreachable broker is an
    /// error the caller must handle.
    async fn enqueue(&self, message: &DispatchMessage) -> Result<(), QueueError>;

    /// Pull the next message, blocking up to `wait`. Expired leases are
    /// reclaimed before new messages are read.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery, ending its lease for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}
