//! Redis Streams-backed task queue (durable, at-least-once delivery).
//!
//! Uses a single stream with one consumer group of competing consumers:
//!
//! - **Durable delivery**: XADD persists the message until XACK
//! - **At-least-once**: unacknowledged entries are redelivered once their
//!   idle time exceeds the lease (XPENDING + XCLAIM)
//! - **Competing consumers**: each worker process dequeues under its own
//!   consumer name; a message is delivered to exactly one live consumer
//!
//! The dispatch payload travels as one JSON field, so the stream carries no
//! schema beyond `job_id` (kept as a separate field for `XRANGE` debugging).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument, warn};

use finsight_core::DispatchMessage;

use super::{Delivery, QueueError, TaskQueue};

/// Default stream key for dispatch messages.
const DEFAULT_STREAM_KEY: &str = "finsight:dispatch";

/// Consumer group shared by all workers.
const GROUP: &str = "workers";

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    lease: Duration,
}

impl RedisStreamsQueue {
    /// Connect and ensure the stream + consumer group exist (idempotent).
    ///
    /// `consumer` names this process within the group (e.g. `worker-1`);
    /// `lease` must exceed the worker's hard execution deadline.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        consumer: impl Into<String>,
        lease: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let queue = Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: GROUP.to_string(),
            consumer: consumer.into(),
            lease,
        };

        let mut conn = queue.conn().await?;
        // XGROUP CREATE with MKSTREAM creates the stream if needed. An
        // existing group answers BUSYGROUP, which we ignore.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&queue.stream_key)
            .arg(&queue.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        Ok(queue)
    }

    pub fn with_stream_key(mut self, key: impl Into<String>) -> Self {
        self.stream_key = key.into();
        self
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }

    /// Take over the oldest pending entry whose lease has lapsed, if any.
    async fn claim_expired(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Option<Delivery>, QueueError> {
        let lease_ms = self.lease.as_millis() as u64;

        // XPENDING with IDLE filters to entries no live consumer is working on.
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(lease_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XPENDING failed: {e}")))?;

        let Some((id, _owner, _idle, delivered)) = pending.into_iter().next() else {
            return Ok(None);
        };

        // XCLAIM with the same min-idle is atomic against other claimers: the
        // entry moves to us only if it is still idle past the lease.
        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(lease_ms)
            .arg(&id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XCLAIM failed: {e}")))?;

        let Some(entry) = claimed.into_iter().next() else {
            return Ok(None);
        };

        let (receipt, fields) = parse_entry(&entry)?;
        let message = message_from_fields(&fields)?;
        debug!(receipt = %receipt, redeliveries = delivered, "claimed expired delivery");

        Ok(Some(Delivery {
            message,
            receipt,
            // XPENDING reports deliveries so far; any claim here is at least
            // the second hand-out.
            redeliveries: delivered.max(1) as u32,
        }))
    }

    /// Read one new entry for this consumer, blocking up to `wait`.
    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XREADGROUP failed: {e}")))?;

        // Nil means the block timed out with nothing to read.
        let redis::Value::Bulk(streams) = reply else {
            return Ok(None);
        };

        let Some(redis::Value::Bulk(stream)) = streams.into_iter().next() else {
            return Ok(None);
        };
        // Stream reply shape: [key, [entry, ...]]
        let Some(redis::Value::Bulk(entries)) = stream.into_iter().nth(1) else {
            return Ok(None);
        };
        let Some(entry) = entries.first() else {
            return Ok(None);
        };

        let (receipt, fields) = parse_entry(entry)?;
        let message = message_from_fields(&fields)?;

        Ok(Some(Delivery {
            message,
            receipt,
            redeliveries: 0,
        }))
    }
}

/// Parse a stream entry (`[id, [field, value, ...]]`) into its id and fields.
fn parse_entry(entry: &redis::Value) -> Result<(String, HashMap<String, String>), QueueError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Codec("invalid entry format".into()));
    };
    let [id, field_list] = parts.as_slice() else {
        return Err(QueueError::Codec("entry too short".into()));
    };

    let redis::Value::Data(id) = id else {
        return Err(QueueError::Codec("invalid entry id".into()));
    };
    let id = String::from_utf8_lossy(id).to_string();

    let redis::Value::Bulk(field_list) = field_list else {
        return Err(QueueError::Codec("invalid entry fields".into()));
    };

    let mut fields = HashMap::new();
    for chunk in field_list.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    Ok((id, fields))
}

fn message_from_fields(fields: &HashMap<String, String>) -> Result<DispatchMessage, QueueError> {
    let payload = fields
        .get("payload")
        .ok_or_else(|| QueueError::Codec("missing payload field".into()))?;
    serde_json::from_str(payload).map_err(|e| QueueError::Codec(format!("bad payload: {e}")))
}

#[async_trait]
impl TaskQueue for RedisStreamsQueue {
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, job_id = %message.job_id), err)]
    async fn enqueue(&self, message: &DispatchMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| QueueError::Codec(e.to_string()))?;

        let mut conn = self.conn().await?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XADD failed: {e}")))?;

        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;

        if let Some(delivery) = self.claim_expired(&mut conn).await? {
            return Ok(Some(delivery));
        }
        self.read_new(&mut conn, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("XACK failed: {e}")))?;

        if acked == 0 {
            // Already acked, or the entry was claimed away after our lease
            // lapsed. Harmless either way.
            warn!(receipt = %delivery.receipt, "ack matched no pending entry");
        }
        Ok(())
    }
}
