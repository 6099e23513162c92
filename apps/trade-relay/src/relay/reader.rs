use feed_bus::{FeedResult, FeedSubscription};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::gate::ReaderTicket;
use super::Relay;

enum PumpExit {
    StopRequested,
    UpstreamClosed,
}

/// Body of the feed reader task. Only ever spawned from inside the relay's
/// lifecycle critical section.
///
/// A failed first subscribe resets the gate so the next attach retries. Once
/// subscribed, an upstream that ends the subscription is resubscribed after
/// one poll interval for as long as clients remain attached.
pub(crate) async fn run(relay: Relay, ticket: ReaderTicket, predecessor: Option<JoinHandle<()>>) {
    let topic = relay.topic().to_string();
    let generation = ticket.generation;

    if let Some(previous) = predecessor {
        debug!(topic = %topic, generation, "waiting for previous feed reader to drain");
        if let Err(err) = previous.await {
            warn!(topic = %topic, generation, error = %err, "previous feed reader ended abnormally");
        }
    }

    let mut subscription = match subscribe(&relay, &topic).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(
                topic = %topic,
                generation,
                error = %err,
                "upstream subscribe failed; next attach will retry"
            );
            relay.reader_exited(generation);
            return;
        }
    };
    info!(topic = %topic, generation, "upstream subscription opened");

    loop {
        let exit = pump(&relay, &ticket, subscription.as_mut()).await;

        if let Err(err) = subscription.close().await {
            warn!(topic = %topic, generation, error = %err, "failed to close upstream subscription");
        }
        relay.stats().record_upstream_close();

        match exit {
            PumpExit::StopRequested => {
                info!(topic = %topic, generation, "upstream subscription closed; no clients attached");
                break;
            }
            PumpExit::UpstreamClosed => {
                warn!(topic = %topic, generation, "upstream ended the subscription; resubscribing");
                match resubscribe(&relay, &ticket, &topic).await {
                    Some(next) => {
                        info!(topic = %topic, generation, "upstream subscription reopened");
                        subscription = next;
                    }
                    None => break,
                }
            }
        }
    }
    relay.reader_exited(generation);
}

async fn subscribe(relay: &Relay, topic: &str) -> FeedResult<Box<dyn FeedSubscription>> {
    relay.stats().record_subscribe_attempt();
    counter!("trade_relay_upstream_subscribe_total", 1);
    let result = relay.feed().subscribe(topic).await;
    if result.is_err() {
        relay.stats().record_subscribe_failure();
        counter!("trade_relay_upstream_subscribe_failures_total", 1);
    }
    result
}

/// Retry every poll interval until a subscription opens or the last client
/// leaves. Returns `None` once a stop has been requested.
async fn resubscribe(
    relay: &Relay,
    ticket: &ReaderTicket,
    topic: &str,
) -> Option<Box<dyn FeedSubscription>> {
    let pause = relay.config().poll_timeout;
    loop {
        tokio::time::sleep(pause).await;
        if ticket.stop_requested() {
            return None;
        }
        match subscribe(relay, topic).await {
            Ok(subscription) => return Some(subscription),
            Err(err) => {
                warn!(topic = %topic, error = %err, "upstream resubscribe failed; retrying");
            }
        }
    }
}

async fn pump(
    relay: &Relay,
    ticket: &ReaderTicket,
    subscription: &mut dyn FeedSubscription,
) -> PumpExit {
    let poll_timeout = relay.config().poll_timeout;

    while !ticket.stop_requested() {
        match subscription.pull(poll_timeout).await {
            Ok(Some(message)) => {
                relay.broadcast(message.payload).await;
            }
            Ok(None) => {}
            Err(err) if err.is_terminal() => return PumpExit::UpstreamClosed,
            Err(err) => {
                relay.stats().record_pull_error();
                counter!("trade_relay_upstream_pull_errors_total", 1);
                debug!(topic = %relay.topic(), error = %err, "transient upstream pull error");
            }
        }
    }

    PumpExit::StopRequested
}
