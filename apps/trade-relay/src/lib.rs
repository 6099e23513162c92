//! Connection-gated WebSocket relay for the stock-trade pub/sub feed.
//!
//! The relay holds an upstream subscription on [`STOCK_TRADE_TOPIC`] only
//! while at least one client is attached at [`STOCK_TRADE_PATH`], and fans
//! every upstream message out to all attached clients in arrival order.

pub mod config;
pub mod producer;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod upstream;
pub mod watch;

pub const STOCK_TRADE_TOPIC: &str = "consume-stock-trade";
pub const STOCK_TRADE_PATH: &str = "/ws/stock/trade";
