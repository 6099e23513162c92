//! Upstream feed contract shared by the relay and its producers.
//!
//! A [`FeedSource`] hands out one [`FeedSubscription`] per `subscribe` call.
//! Subscriptions are pulled with a bounded wait so callers can interleave
//! their own stop checks between reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

const LOCAL_TOPIC_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("feed subscription closed")]
    Closed,
    #[error("feed transport error: {0}")]
    Transport(String),
    #[error("feed subscriber lagged by {0} messages")]
    Lagged(u64),
}

impl FeedError {
    /// Errors after which the subscription cannot produce further messages.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedError::Closed)
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn subscribe(&self, topic: &str) -> FeedResult<Box<dyn FeedSubscription>>;
}

#[async_trait]
pub trait FeedSubscription: Send {
    /// Wait at most `timeout` for the next message. `Ok(None)` means the
    /// wait elapsed with nothing to deliver.
    async fn pull(&mut self, timeout: Duration) -> FeedResult<Option<FeedMessage>>;

    async fn close(self: Box<Self>) -> FeedResult<()>;
}

#[async_trait]
pub trait FeedPublisher: Send + Sync {
    /// Publish `payload` on `topic`, returning how many subscribers saw it.
    async fn publish(&self, topic: &str, payload: Bytes) -> FeedResult<usize>;
}

/// In-process feed for tests and broker-less runs.
#[derive(Debug, Default)]
pub struct LocalFeed {
    topics: RwLock<HashMap<String, broadcast::Sender<FeedMessage>>>,
    counters: Arc<LocalCounters>,
    refuse_subscribe: AtomicBool,
}

#[derive(Debug, Default)]
struct LocalCounters {
    subscribe_attempts: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicUsize,
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<FeedMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_TOPIC_DEPTH).0)
            .clone()
    }

    /// Make subsequent `subscribe` calls fail until cleared.
    pub fn set_refuse_subscribe(&self, refuse: bool) {
        self.refuse_subscribe.store(refuse, Ordering::SeqCst);
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.counters.subscribe_attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Subscriptions handed out and not yet closed or dropped.
    pub fn open_subscriptions(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drop every live receiver on `topic`, as a broker restart would.
    pub fn disconnect_topic(&self, topic: &str) {
        self.topics.write().remove(topic);
    }

    pub fn publish_now(&self, topic: &str, payload: Bytes) -> usize {
        let message = FeedMessage {
            topic: topic.to_string(),
            payload,
        };
        // No receivers is not an error on a pub/sub feed.
        self.sender_for(topic).send(message).unwrap_or(0)
    }
}

#[async_trait]
impl FeedSource for LocalFeed {
    async fn subscribe(&self, topic: &str) -> FeedResult<Box<dyn FeedSubscription>> {
        self.counters
            .subscribe_attempts
            .fetch_add(1, Ordering::SeqCst);
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(FeedError::Subscribe {
                topic: topic.to_string(),
                reason: "local feed refusing subscriptions".into(),
            });
        }
        let receiver = self.sender_for(topic).subscribe();
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalSubscription {
            receiver,
            counters: Arc::clone(&self.counters),
        }))
    }
}

#[async_trait]
impl FeedPublisher for LocalFeed {
    async fn publish(&self, topic: &str, payload: Bytes) -> FeedResult<usize> {
        Ok(self.publish_now(topic, payload))
    }
}

#[async_trait]
impl<T: FeedPublisher + ?Sized> FeedPublisher for Arc<T> {
    async fn publish(&self, topic: &str, payload: Bytes) -> FeedResult<usize> {
        (**self).publish(topic, payload).await
    }
}

struct LocalSubscription {
    receiver: broadcast::Receiver<FeedMessage>,
    counters: Arc<LocalCounters>,
}

#[async_trait]
impl FeedSubscription for LocalSubscription {
    async fn pull(&mut self, timeout: Duration) -> FeedResult<Option<FeedMessage>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                Err(FeedError::Lagged(skipped))
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => Err(FeedError::Closed),
        }
    }

    async fn close(self: Box<Self>) -> FeedResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for LocalSubscription {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "consume-stock-trade";

    #[test_timeout::tokio_timeout_test(5)]
    async fn local_feed_delivers_in_publish_order() {
        let feed = LocalFeed::new();
        let mut sub = feed.subscribe(TOPIC).await.expect("subscribe ok");
        assert_eq!(feed.subscriber_count(TOPIC), 1);

        feed.publish(TOPIC, Bytes::from_static(b"m1")).await.expect("publish m1");
        feed.publish(TOPIC, Bytes::from_static(b"m2")).await.expect("publish m2");

        let first = sub.pull(Duration::from_millis(200)).await.expect("pull ok");
        let second = sub.pull(Duration::from_millis(200)).await.expect("pull ok");
        assert_eq!(first.map(|m| m.payload), Some(Bytes::from_static(b"m1")));
        assert_eq!(second.map(|m| m.payload), Some(Bytes::from_static(b"m2")));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn pull_times_out_without_traffic() {
        let feed = LocalFeed::new();
        let mut sub = feed.subscribe(TOPIC).await.expect("subscribe ok");
        let pulled = sub.pull(Duration::from_millis(20)).await.expect("pull ok");
        assert!(pulled.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn publish_without_subscribers_is_not_an_error() {
        let feed = LocalFeed::new();
        let seen = feed
            .publish(TOPIC, Bytes::from_static(b"nobody"))
            .await
            .expect("publish ok");
        assert_eq!(seen, 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn refused_subscribe_is_counted_but_not_opened() {
        let feed = LocalFeed::new();
        feed.set_refuse_subscribe(true);
        let err = feed.subscribe(TOPIC).await.err().expect("subscribe refused");
        assert!(matches!(err, FeedError::Subscribe { .. }));
        assert_eq!(feed.subscribe_attempts(), 1);
        assert_eq!(feed.open_subscriptions(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_and_drop_track_open_subscriptions() {
        let feed = LocalFeed::new();
        let sub = feed.subscribe(TOPIC).await.expect("subscribe ok");
        assert_eq!(feed.open_subscriptions(), 1);
        sub.close().await.expect("close ok");
        assert_eq!(feed.closes(), 1);
        assert_eq!(feed.open_subscriptions(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn disconnected_topic_reports_terminal_error() {
        let feed = LocalFeed::new();
        let mut sub = feed.subscribe(TOPIC).await.expect("subscribe ok");
        feed.disconnect_topic(TOPIC);
        let err = sub
            .pull(Duration::from_millis(200))
            .await
            .expect_err("closed feed");
        assert!(err.is_terminal());
    }
}
