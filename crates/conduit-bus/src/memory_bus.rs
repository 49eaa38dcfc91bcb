use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::Result;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::adapter::{BrokerTime, BusAdapter, MessageHandler, SubscriptionToken};

struct Subscription {
    channel: String,
    cancel: Option<oneshot::Sender<()>>,
}

/// An in-process [`BusAdapter`] used by every downstream crate's test
/// suite so lifecycle, alignment, and connector logic can be exercised
/// without a running broker. Fan-out is synchronous per publish call but
/// each handler still runs isolated from the others (matching "handlers
/// invoked serially per subscription, concurrently across subscriptions").
#[derive(Default)]
pub struct InMemoryBus {
    channels: DashMap<String, Vec<(u64, MessageHandler)>>,
    kv: DashMap<String, serde_json::Value>,
    reservations: DashMap<String, String>,
    subscriptions: DashMap<u64, Subscription>,
    next_token: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_token: AtomicU64::new(1),
            ..Default::default()
        })
    }
}

#[async_trait]
impl BusAdapter for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        let mut delivered = 0;
        if let Some(handlers) = self.channels.get(channel) {
            for (_, handler) in handlers.iter() {
                handler(payload.clone());
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<SubscriptionToken> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((token, handler));
        self.subscriptions.insert(
            token,
            Subscription {
                channel: channel.to_string(),
                cancel: None,
            },
        );
        Ok(SubscriptionToken(token))
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        if let Some((_, subscription)) = self.subscriptions.remove(&token.0) {
            if let Some(mut handlers) = self.channels.get_mut(&subscription.channel) {
                handlers.retain(|(t, _)| *t != token.0);
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        use dashmap::mapref::entry::Entry;
        match self.reservations.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.reservations.remove(key);
        Ok(())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        self.kv.remove(key);
        Ok(())
    }

    async fn time(&self) -> Result<BrokerTime> {
        let now = chrono::Utc::now();
        Ok(BrokerTime {
            seconds: now.timestamp(),
            microseconds: now.timestamp_subsec_micros() as i64,
        })
    }

    async fn close(&self) -> Result<()> {
        let tokens: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for token in tokens {
            self.unsubscribe(SubscriptionToken(token)).await?;
        }
        Ok(())
    }
}
