//! Subscribe-before-publish request/reply helper shared by every blocking
//! call a connector makes (SPEC_FULL.md §4.G): a random non-zero request id
//! correlates the reply, and the subscription is established before the
//! request is published so a fast responder can never win the race.

use std::sync::Arc;
use std::time::Duration;

use conduit_bus::{BusAdapter, SubscriptionToken};
use conduit_core::{frame, Envelope};
use tokio::sync::oneshot;

pub enum RequestOutcome {
    Reply(Envelope),
    Timeout,
}

/// Generate a random request id in `1..=i64::MAX`, avoiding both `0`
/// (`UNSET_REQUEST_ID`) and `-1` (`IGNORE_REQUEST_ID`).
fn random_request_id() -> i64 {
    loop {
        let candidate = (rand::random::<u64>() >> 1) as i64;
        if candidate > 0 {
            return candidate;
        }
    }
}

/// Publish `envelope` (stamped with a fresh request id) on `channel` and
/// wait up to `timeout` for a reply carrying the same id on the same
/// channel. The subscription is torn down before returning either way.
pub async fn request_reply(
    bus: &Arc<dyn BusAdapter>,
    channel: &str,
    envelope: Envelope,
    timeout: Duration,
) -> RequestOutcome {
    let request_id = random_request_id();
    let envelope = envelope.with_request_id(request_id);

    let (tx, rx) = oneshot::channel();
    let tx = parking_lot::Mutex::new(Some(tx));

    let token = match bus
        .subscribe(
            channel,
            Box::new(move |bytes| {
                let Ok(reply) = frame::decode(&bytes) else { return };
                if reply.is_request() || reply.request_id != request_id {
                    return;
                }
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(reply);
                }
            }),
        )
        .await
    {
        Ok(token) => token,
        Err(_) => return RequestOutcome::Timeout,
    };

    let outcome = async {
        let bytes = match frame::encode(&envelope) {
            Ok(bytes) => bytes,
            Err(_) => return RequestOutcome::Timeout,
        };
        if bus.publish(channel, bytes).await.is_err() {
            return RequestOutcome::Timeout;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => RequestOutcome::Reply(reply),
            _ => RequestOutcome::Timeout,
        }
    }
    .await;

    let _ = unsubscribe(bus, token).await;
    outcome
}

async fn unsubscribe(bus: &Arc<dyn BusAdapter>, token: SubscriptionToken) -> conduit_core::Result<()> {
    bus.unsubscribe(token).await
}
