//! Minimal stream client: connect to a relay and print what it forwards.

use std::io::Write;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::config::WatchArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Print each data frame from `url` on its own line. Returns the number of
/// frames printed once `count` is reached or the relay ends the stream.
pub async fn watch_frames<W: Write>(url: &str, count: Option<usize>, mut out: W) -> Result<usize> {
    debug!(url, "connecting to relay");
    let (ws_stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!(url, error = %err, "failed to connect");
            return Err(anyhow::anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout after {}s - is the relay running?",
                CONNECT_TIMEOUT.as_secs()
            ));
        }
    };
    let (_write, mut read) = ws_stream.split();

    let mut printed = 0;
    if count == Some(0) {
        return Ok(printed);
    }
    while let Some(message) = read.next().await {
        match message.context("stream read failed")? {
            Message::Text(text) => writeln!(out, "{}", text.as_str())?,
            Message::Binary(data) => writeln!(out, "{}", String::from_utf8_lossy(&data))?,
            Message::Close(_) => break,
            _ => continue,
        }
        out.flush()?;
        printed += 1;
        if count.is_some_and(|limit| printed >= limit) {
            break;
        }
    }
    Ok(printed)
}

pub async fn run(args: WatchArgs) -> Result<()> {
    tokio::select! {
        result = watch_frames(&args.url, args.count, std::io::stdout()) => {
            let printed = result?;
            info!(printed, "stream ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }
    Ok(())
}
