use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::relay::RelayConfig;

#[derive(Debug, Parser)]
#[command(
    name = "trade-relay",
    author,
    version,
    about = "Relays the stock-trade feed to WebSocket clients while any are attached"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Redis connection URI for the upstream pub/sub feed.
    #[arg(
        long,
        global = true,
        env = "TRADE_RELAY_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish simulated stock trades to the relay topic
    Produce(ProduceArgs),
    /// Connect to a relay and print every frame it sends
    Watch(WatchArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TRADE_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:9090")]
    pub listen_addr: String,

    /// Longest single wait on the upstream feed; bounds reader stop latency.
    #[arg(long, env = "TRADE_RELAY_POLL_TIMEOUT_MS", default_value_t = 1000)]
    pub poll_timeout_ms: u64,

    /// Longest a single client write may take before the client is pruned.
    #[arg(long, env = "TRADE_RELAY_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TRADE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,

    /// Host header values allowed to open a stream. Empty allows any host.
    #[arg(
        long = "allowed-host",
        env = "TRADE_RELAY_ALLOWED_HOSTS",
        value_delimiter = ','
    )]
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ProduceArgs {
    /// Milliseconds between published ticks.
    #[arg(long, env = "TRADE_RELAY_PRODUCE_INTERVAL_MS", default_value_t = 1000)]
    pub interval_ms: u64,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Relay stream URL.
    #[arg(long, default_value = "ws://127.0.0.1:9090/ws/stock/trade")]
    pub url: String,

    /// Exit after this many data frames.
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub relay: RelayConfig,
    pub shutdown_grace: Duration,
    pub allowed_hosts: Vec<String>,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let serve = cli.serve;
        let listen_addr: SocketAddr = serve
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", serve.listen_addr))?;
        if serve.poll_timeout_ms == 0 {
            anyhow::bail!("--poll-timeout-ms must be greater than zero");
        }
        if serve.write_timeout_ms == 0 {
            anyhow::bail!("--write-timeout-ms must be greater than zero");
        }

        let allowed_hosts = serve
            .allowed_hosts
            .into_iter()
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .collect();

        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            relay: RelayConfig {
                poll_timeout: Duration::from_millis(serve.poll_timeout_ms),
                write_timeout: Duration::from_millis(serve.write_timeout_ms),
            },
            shutdown_grace: Duration::from_secs(serve.shutdown_grace_secs),
            allowed_hosts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("trade-relay").chain(args.iter().copied()))
            .expect("arguments parse")
    }

    #[test_timeout::timeout(5)]
    fn defaults_build_a_valid_config() {
        let config = ServerConfig::try_from(parse(&[])).expect("valid defaults");
        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.relay.poll_timeout, Duration::from_millis(1000));
        assert_eq!(config.relay.write_timeout, Duration::from_millis(5000));
        assert!(config.allowed_hosts.is_empty());
    }

    #[test_timeout::timeout(5)]
    fn allowed_hosts_accept_lists_and_repeats() {
        let config = ServerConfig::try_from(parse(&[
            "--allowed-host",
            "relay.local:9090, example.com",
            "--allowed-host",
            "127.0.0.1:9090",
        ]))
        .expect("valid config");
        assert_eq!(
            config.allowed_hosts,
            vec!["relay.local:9090", "example.com", "127.0.0.1:9090"]
        );
    }

    #[test_timeout::timeout(5)]
    fn rejects_bad_listen_address_and_zero_poll() {
        assert!(ServerConfig::try_from(parse(&["--listen-addr", "nowhere"])).is_err());
        assert!(ServerConfig::try_from(parse(&["--poll-timeout-ms", "0"])).is_err());
    }

    #[test_timeout::timeout(5)]
    fn subcommands_parse() {
        let cli = parse(&["produce", "--interval-ms", "250"]);
        assert!(matches!(
            cli.command,
            Some(Command::Produce(ProduceArgs { interval_ms: 250 }))
        ));

        let cli = parse(&["watch", "-n", "3"]);
        match cli.command {
            Some(Command::Watch(args)) => assert_eq!(args.count, Some(3)),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
