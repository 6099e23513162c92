//! Simulated stock-trade publisher feeding the relay topic.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use feed_bus::FeedPublisher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProduceArgs;
use crate::upstream::RedisFeed;
use crate::STOCK_TRADE_TOPIC;

/// Largest change a single purchase or sale applies to a stock entry.
const MAX_SWING: f64 = 3_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockTrade {
    pub stock: f64,
    pub currency: String,
    pub last_updated: String,
    pub id: String,
}

impl StockTrade {
    pub fn new(stock: f64, currency: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            stock,
            currency: currency.into(),
            last_updated: timestamp_now(),
            id: id.into(),
        }
    }

    /// Roll one of eleven outcomes: 1 is a purchase, 2 a sale, the rest
    /// leave the stock untouched. Stock never goes negative. `last_updated`
    /// keeps the creation timestamp.
    pub fn update<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        match rng.gen_range(0..=10) {
            1 => self.stock += rng.gen::<f64>() * MAX_SWING,
            2 if self.stock > 0.0 => {
                self.stock = (self.stock - rng.gen::<f64>() * MAX_SWING).max(0.0);
            }
            _ => {}
        }
    }
}

pub fn seed_trades() -> Vec<StockTrade> {
    vec![
        StockTrade::new(300_000.00, "USD", "BIZ1"),
        StockTrade::new(400_000.00, "USD", "BIZ2"),
        StockTrade::new(500_000.00, "USD", "BIZ3"),
    ]
}

fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct Producer<P> {
    publisher: P,
    topic: String,
    interval: Duration,
    trades: Vec<StockTrade>,
    rng: StdRng,
}

impl<P: FeedPublisher> Producer<P> {
    pub fn new(publisher: P, topic: impl Into<String>, interval: Duration) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            interval,
            trades: seed_trades(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Advance every entry one step and encode the book as a JSON array.
    pub fn tick(&mut self) -> Result<Bytes> {
        for trade in &mut self.trades {
            trade.update(&mut self.rng);
        }
        let encoded = serde_json::to_vec(&self.trades).context("failed to encode trades")?;
        Ok(Bytes::from(encoded))
    }

    /// Publish one tick per interval until `shutdown` resolves. Publish
    /// failures are logged and the loop carries on.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.interval);
        info!(topic = %self.topic, interval_ms = self.interval.as_millis() as u64, "producer started");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let payload = self.tick()?;
                    match self.publisher.publish(&self.topic, payload).await {
                        Ok(receivers) => debug!(topic = %self.topic, receivers, "published trade tick"),
                        Err(err) => warn!(topic = %self.topic, error = %err, "producer publish failed"),
                    }
                }
            }
        }

        info!(topic = %self.topic, "producer stopped");
        Ok(())
    }
}

pub async fn run_cli(redis_url: &str, args: ProduceArgs) -> Result<()> {
    if args.interval_ms == 0 {
        anyhow::bail!("--interval-ms must be greater than zero");
    }
    let publisher = RedisFeed::open(redis_url)?.publisher().await?;
    let producer = Producer::new(
        publisher,
        STOCK_TRADE_TOPIC,
        Duration::from_millis(args.interval_ms),
    );
    producer
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_bus::{FeedSource, LocalFeed};
    use std::sync::Arc;

    #[test_timeout::timeout(5)]
    fn update_never_drives_stock_negative() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut trade = StockTrade::new(10.0, "USD", "LOW");
        for _ in 0..10_000 {
            trade.update(&mut rng);
            assert!(trade.stock >= 0.0);
        }
    }

    #[test_timeout::timeout(5)]
    fn update_keeps_creation_timestamp() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut trade = StockTrade::new(300_000.0, "USD", "BIZ1");
        let created = trade.last_updated.clone();
        for _ in 0..100 {
            trade.update(&mut rng);
        }
        assert_eq!(trade.last_updated, created);
    }

    #[test_timeout::timeout(5)]
    fn tick_encodes_the_whole_book() {
        let feed = Arc::new(LocalFeed::new());
        let mut producer = Producer::new(feed, STOCK_TRADE_TOPIC, Duration::from_millis(10)).with_seed(1);

        let payload = producer.tick().expect("tick encodes");
        let value: serde_json::Value = serde_json::from_slice(&payload).expect("valid json");
        let entries = value.as_array().expect("json array");
        assert_eq!(entries.len(), 3);
        for entry in entries {
            for field in ["stock", "currency", "last_updated", "id"] {
                assert!(entry.get(field).is_some(), "missing {field}");
            }
        }

        let decoded: Vec<StockTrade> = serde_json::from_slice(&payload).expect("decodes");
        let ids: Vec<&str> = decoded.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["BIZ1", "BIZ2", "BIZ3"]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn run_publishes_until_shutdown() {
        let feed = Arc::new(LocalFeed::new());
        let mut subscription = feed.subscribe(STOCK_TRADE_TOPIC).await.expect("subscribe");
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let producer = Producer::new(feed.clone(), STOCK_TRADE_TOPIC, Duration::from_millis(10));
        let task = tokio::spawn(producer.run(async {
            let _ = stop_rx.await;
        }));

        let first = subscription
            .pull(Duration::from_secs(2))
            .await
            .expect("pull ok")
            .expect("tick published");
        let book: Vec<StockTrade> = serde_json::from_slice(&first.payload).expect("trade book");
        assert_eq!(book.len(), 3);

        let _ = stop_tx.send(());
        task.await.expect("producer task").expect("producer exits cleanly");
    }
}
