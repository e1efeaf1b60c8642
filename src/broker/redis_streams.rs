//! Redis Streams adapter.
//!
//! Each pipeline stream is a Redis stream whose entries carry the JSON
//! payload in a single `payload` field. Consumers read through a consumer
//! group (`XREADGROUP ... >`), so instances in the same group split the load,
//! and acknowledge an entry as soon as it is handed to the caller. Entries
//! left pending by an abandoned read are handed out before new ones.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info};

use super::{BrokerError, MessageSink, MessageSource};

// ---

const PAYLOAD_FIELD: &str = "payload";

/// Server-side block per `XREADGROUP` round trip, in milliseconds.
const BLOCK_MS: usize = 1_000;

#[derive(Clone)]
pub struct RedisStreamPublisher {
    conn: ConnectionManager,
    stream: String,
}

impl RedisStreamPublisher {
    // ---
    pub async fn connect(url: &str, stream: impl Into<String>) -> Result<Self, BrokerError> {
        // ---
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisStreamPublisher {
            conn,
            stream: stream.into(),
        })
    }
}

#[async_trait]
impl MessageSink for RedisStreamPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        // ---
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(&self.stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        debug!(stream = %self.stream, %id, "published entry");
        Ok(())
    }
}

/// A consumer in a Redis consumer group.
///
/// Holds its own connection so the blocking read does not delay commands
/// issued by other components.
#[derive(Clone)]
pub struct RedisStreamConsumer {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisStreamConsumer {
    // ---
    /// Connect and make sure the stream and group exist.
    pub async fn connect(
        url: &str,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        // ---
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let stream = stream.into();
        let group = group.into();

        // Start new groups at the beginning of the stream.
        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(&stream, &group, "0").await;
        match created {
            Ok(()) => info!(%stream, %group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(%stream, %group, "consumer group already exists")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(RedisStreamConsumer {
            conn,
            stream,
            group,
            consumer: consumer.into(),
        })
    }
}

impl RedisStreamConsumer {
    // ---
    fn read_options(&self) -> StreamReadOptions {
        StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
    }

    /// Acknowledge `entry` and hand back its payload.
    async fn take(
        &self,
        conn: &mut ConnectionManager,
        entry: StreamId,
    ) -> Result<Vec<u8>, BrokerError> {
        // ---
        let _: i64 = conn.xack(&self.stream, &self.group, &[&entry.id]).await?;
        entry
            .get::<Vec<u8>>(PAYLOAD_FIELD)
            .ok_or(BrokerError::MissingPayload(entry.id))
    }
}

/// First delivered entry of a read, if any. Nil replies (block expired) and
/// empty pending lists both yield `None`.
fn first_entry(reply: Option<StreamReadReply>) -> Option<StreamId> {
    reply
        .into_iter()
        .flat_map(|r| r.keys)
        .flat_map(|k| k.ids)
        .next()
}

#[async_trait]
impl MessageSource for RedisStreamConsumer {
    /// Cancel-safe: an entry delivered to a read whose future was dropped
    /// stays in this consumer's pending list and is returned by the next
    /// call. The connection is multiplexed, so that pending read is served
    /// only after the abandoned blocking read has completed on the server.
    async fn fetch(&self) -> Result<Vec<u8>, BrokerError> {
        // ---
        let mut conn = self.conn.clone();

        let pending: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &["0"], &self.read_options())
            .await?;
        if let Some(entry) = first_entry(pending) {
            debug!(stream = %self.stream, id = %entry.id, "recovered pending entry");
            return self.take(&mut conn, entry).await;
        }

        let opts = self.read_options().block(BLOCK_MS);
        loop {
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&self.stream], &[">"], &opts)
                .await?;
            if let Some(entry) = first_entry(reply) {
                return self.take(&mut conn, entry).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use redis::streams::StreamKey;
    use redis::Value;
    use std::collections::HashMap;

    fn entry(id: &str, payload: Option<&[u8]>) -> StreamId {
        // ---
        let mut map = HashMap::new();
        if let Some(payload) = payload {
            map.insert(PAYLOAD_FIELD.to_string(), Value::Data(payload.to_vec()));
        }
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    fn reply(ids: Vec<StreamId>) -> Option<StreamReadReply> {
        Some(StreamReadReply {
            keys: vec![StreamKey {
                key: "raw-air-data".to_string(),
                ids,
            }],
        })
    }

    #[test]
    fn test_first_entry_of_empty_reads() {
        // ---
        assert!(first_entry(None).is_none());
        // pending read with nothing outstanding
        assert!(first_entry(reply(Vec::new())).is_none());
    }

    #[test]
    fn test_first_entry_returns_oldest() {
        // ---
        let found = first_entry(reply(vec![
            entry("1-0", Some(b"one")),
            entry("2-0", Some(b"two")),
        ]))
        .unwrap();

        assert_eq!(found.id, "1-0");
        assert_eq!(found.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap(), b"one");
        assert!(entry("3-0", None).get::<Vec<u8>>(PAYLOAD_FIELD).is_none());
    }
}
