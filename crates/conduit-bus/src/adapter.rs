use async_trait::async_trait;
use conduit_core::Result;

/// A handle to a live subscription. Dropping it does not unsubscribe —
/// callers must pass it to [`BusAdapter::unsubscribe`] explicitly, matching
/// the explicit-unsubscribe contract in SPEC_FULL.md §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// Broker time as reported by the bus itself, used so services never trust
/// local clocks for cross-device timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerTime {
    pub seconds: i64,
    pub microseconds: i64,
}

impl BrokerTime {
    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + (self.microseconds as f64 / 1_000_000.0)
    }
}

/// A handler invoked once per message delivered to a subscription. Runs on
/// a dedicated worker for that subscription; the adapter never invokes it
/// re-entrantly for the same subscription.
pub type MessageHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Abstracts a publish/subscribe broker with a small key-value surface for
/// reservations and data-stream descriptors (SPEC_FULL.md §4.A).
///
/// Implementations must be cheap to clone (an `Arc` internally) and safe to
/// share across every component, connector, and manager in a process — the
/// Application Context owns exactly one and lends it out as `Arc<dyn
/// BusAdapter>` (SPEC_FULL.md §9, bus ownership resolution).
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Publish raw bytes on `channel`. Returns the number of subscribers the
    /// broker delivered to.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;

    /// Subscribe `handler` to `channel` on a dedicated worker. Returns a
    /// token usable with [`Self::unsubscribe`].
    async fn subscribe(&self, channel: &str, handler: MessageHandler) -> Result<SubscriptionToken>;

    /// Idempotent: unsubscribing an already-removed token is a no-op.
    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<()>;

    /// Atomic set-if-absent. Returns `true` if the key was not already set.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Delete a key set via [`Self::set_if_absent`]. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn delete_key(&self, key: &str) -> Result<()>;

    /// The broker's own clock, used for sensor/output timestamps.
    async fn time(&self) -> Result<BrokerTime>;

    /// Unsubscribe every live token and tear down the connection.
    /// Idempotent.
    async fn close(&self) -> Result<()>;
}
