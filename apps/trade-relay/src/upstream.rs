//! Redis pub/sub as the relay's upstream feed.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use feed_bus::{FeedError, FeedMessage, FeedPublisher, FeedResult, FeedSource, FeedSubscription};
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};

#[derive(Clone)]
pub struct RedisFeed {
    client: Client,
}

impl RedisFeed {
    /// Validates the URL only; connections are opened per subscription.
    pub fn open(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("invalid redis url: {redis_url}"))?;
        Ok(Self { client })
    }

    pub async fn publisher(&self) -> Result<RedisPublisher> {
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .context("failed to connect to redis")?;
        Ok(RedisPublisher { conn })
    }
}

#[async_trait]
impl FeedSource for RedisFeed {
    async fn subscribe(&self, topic: &str) -> FeedResult<Box<dyn FeedSubscription>> {
        let subscribe_error = |err: redis::RedisError| FeedError::Subscribe {
            topic: topic.to_string(),
            reason: err.to_string(),
        };

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(subscribe_error)?;
        pubsub.subscribe(topic).await.map_err(subscribe_error)?;

        Ok(Box::new(RedisSubscription {
            pubsub,
            topic: topic.to_string(),
        }))
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    topic: String,
}

#[async_trait]
impl FeedSubscription for RedisSubscription {
    async fn pull(&mut self, timeout: Duration) -> FeedResult<Option<FeedMessage>> {
        let next = {
            let mut messages = self.pubsub.on_message();
            tokio::time::timeout(timeout, messages.next()).await
        };
        match next {
            Err(_) => Ok(None),
            // The message stream only ends when the connection is gone.
            Ok(None) => Err(FeedError::Closed),
            Ok(Some(msg)) => Ok(Some(FeedMessage {
                topic: msg.get_channel_name().to_string(),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })),
        }
    }

    async fn close(self: Box<Self>) -> FeedResult<()> {
        let RedisSubscription { mut pubsub, topic } = *self;
        pubsub
            .unsubscribe(&topic)
            .await
            .map_err(|err| FeedError::Transport(err.to_string()))
    }
}

#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
}

#[async_trait]
impl FeedPublisher for RedisPublisher {
    async fn publish(&self, topic: &str, payload: Bytes) -> FeedResult<usize> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        Ok(receivers.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout(5)]
    fn rejects_malformed_url() {
        assert!(RedisFeed::open("not a url").is_err());
        assert!(RedisFeed::open("redis://127.0.0.1:6379").is_ok());
    }
}
