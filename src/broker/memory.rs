//! In-process topic with consumer-group offsets.
//!
//! Every group sees every message once; consumers sharing a group split the
//! messages between them. Nothing is persisted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BrokerError, MessageSink, MessageSource};

// ---

#[derive(Default)]
struct TopicState {
    log: Vec<Vec<u8>>,
    offsets: HashMap<String, usize>,
    closed: bool,
}

/// A single in-memory stream.
#[derive(Clone, Default)]
pub struct MemoryTopic {
    state: Arc<Mutex<TopicState>>,
    notify: Arc<Notify>,
}

impl MemoryTopic {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            topic: self.clone(),
        }
    }

    /// A consumer in `group`. Groups start at the beginning of the log.
    pub fn subscribe(&self, group: impl Into<String>) -> MemoryConsumer {
        MemoryConsumer {
            topic: self.clone(),
            group: group.into(),
        }
    }

    /// Number of messages ever published.
    pub fn len(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All published payloads, in order.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.lock().log.clone()
    }

    /// Wake every waiting consumer with [`BrokerError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append(&self, payload: &[u8]) -> Result<(), BrokerError> {
        // ---
        {
            let mut state = self.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.log.push(payload.to_vec());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn take_next(&self, group: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        // ---
        let mut state = self.lock();
        let offset = state.offsets.get(group).copied().unwrap_or(0);
        if let Some(payload) = state.log.get(offset).cloned() {
            state.offsets.insert(group.to_string(), offset + 1);
            return Ok(Some(payload));
        }
        if state.closed {
            return Err(BrokerError::Closed);
        }
        Ok(None)
    }
}

#[derive(Clone)]
pub struct MemoryPublisher {
    topic: MemoryTopic,
}

#[async_trait]
impl MessageSink for MemoryPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        self.topic.append(payload)
    }
}

#[derive(Clone)]
pub struct MemoryConsumer {
    topic: MemoryTopic,
    group: String,
}

#[async_trait]
impl MessageSource for MemoryConsumer {
    async fn fetch(&self) -> Result<Vec<u8>, BrokerError> {
        // ---
        loop {
            // Register interest before checking so a publish in between is not missed.
            let notified = self.topic.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.topic.take_next(&self.group)? {
                return Ok(payload);
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_groups_each_see_every_message() {
        // ---
        let topic = MemoryTopic::new();
        let publisher = topic.publisher();
        publisher.publish(b"one").await.unwrap();
        publisher.publish(b"two").await.unwrap();

        let a = topic.subscribe("group-a");
        let b = topic.subscribe("group-b");

        assert_eq!(a.fetch().await.unwrap(), b"one");
        assert_eq!(a.fetch().await.unwrap(), b"two");
        assert_eq!(b.fetch().await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_consumers_in_group_share_offset() {
        // ---
        let topic = MemoryTopic::new();
        topic.publisher().publish(b"one").await.unwrap();
        topic.publisher().publish(b"two").await.unwrap();

        let first = topic.subscribe("g");
        let second = topic.subscribe("g");

        assert_eq!(first.fetch().await.unwrap(), b"one");
        assert_eq!(second.fetch().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_fetch_waits_for_publish() {
        // ---
        let topic = MemoryTopic::new();
        let consumer = topic.subscribe("g");
        let publisher = topic.publisher();

        let pending = tokio::spawn(async move { consumer.fetch().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(b"late").await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"late");
    }

    #[tokio::test]
    async fn test_timed_out_fetch_loses_nothing() {
        // ---
        let topic = MemoryTopic::new();
        let consumer = topic.subscribe("g");

        let expired = tokio::time::timeout(Duration::from_millis(20), consumer.fetch()).await;
        assert!(expired.is_err());

        topic.publisher().publish(b"after").await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(1), consumer.fetch())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"after");
    }

    #[tokio::test]
    async fn test_close_wakes_consumers() {
        // ---
        let topic = MemoryTopic::new();
        let consumer = topic.subscribe("g");

        let pending = tokio::spawn(async move { consumer.fetch().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        topic.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(topic.publisher().publish(b"x").await.is_err());
    }
}
