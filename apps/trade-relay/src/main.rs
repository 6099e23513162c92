use anyhow::Result;
use clap::Parser;
use tracing::info;

use trade_relay::config::{Cli, Command, ServerConfig};
use trade_relay::{producer, server, telemetry, watch};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let mut cli = Cli::parse();
    match cli.command.take() {
        Some(Command::Produce(args)) => producer::run_cli(&cli.redis_url, args).await,
        Some(Command::Watch(args)) => watch::run(args).await,
        None => {
            let config = ServerConfig::try_from(cli)?;
            info!(
                listen_addr = %config.listen_addr,
                redis_url = %config.redis_url,
                poll_timeout_ms = config.relay.poll_timeout.as_millis() as u64,
                allowed_hosts = ?config.allowed_hosts,
                "starting trade-relay"
            );
            server::run(config, telemetry.metrics_handle()).await
        }
    }
}
