//! The watermark-style join every service uses to align *N* input kinds by
//! timestamp before handing a complete tuple to user logic
//! (SPEC_FULL.md §4.E).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_bus::{BusAdapter, SubscriptionToken};
use conduit_core::{frame, Envelope, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;

use conduit_component::{Component, ComponentBase, ComponentSpec, RunningComponent};

/// Per-source ring depth. A source producing faster than the aligner
/// consumes loses its oldest entries once a bucket hits this size.
pub const MAX_MESSAGE_BUFFER_SIZE: usize = 10;

/// Two buckets whose newest messages are within this many seconds of the
/// reference timestamp are considered aligned.
pub const DEFAULT_MAX_TIMESTAMP_DIFF_SECONDS: f64 = 0.5;

const ALIGNMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Thresholds at which a bucket's drop counter is logged, to avoid log
/// spam under sustained overflow (SPEC_FULL.md §4.E).
const DROP_LOG_THRESHOLDS: &[u64] = &[5, 10, 50, 100, 200, 1000, 5000, 10000];

/// User logic a [`Aligner`] drives once every declared input kind has a
/// timestamp-aligned message available.
#[async_trait]
pub trait AlignerLogic: Send + Sync {
    /// The *N* input kinds this service aligns. Order is not significant —
    /// `execute` receives a map keyed by kind.
    fn declared_inputs(&self) -> &[String];

    fn output_kind(&self) -> &str;

    /// Called with exactly one message per declared kind, all within
    /// [`Aligner::max_timestamp_diff`] of the reference timestamp. Returning
    /// `None` means "nothing to publish this round" — not an error.
    async fn execute(&self, inputs: HashMap<String, Envelope>) -> Result<Option<Envelope>>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

type BucketKey = (String, String);

#[derive(Default)]
struct Buckets {
    rings: Mutex<HashMap<BucketKey, VecDeque<Envelope>>>,
    drop_counts: Mutex<HashMap<BucketKey, u64>>,
    last_active: Mutex<HashMap<String, BucketKey>>,
}

impl Buckets {
    fn push(&self, envelope: Envelope) {
        let key = (envelope.kind.clone(), envelope.previous_component_name.clone());
        let mut rings = self.rings.lock();
        let ring = rings.entry(key.clone()).or_default();
        if ring.len() >= MAX_MESSAGE_BUFFER_SIZE {
            ring.pop_front();
            drop(rings);
            let mut counts = self.drop_counts.lock();
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            if DROP_LOG_THRESHOLDS.contains(count) {
                tracing::warn!(kind = %key.0, source = %key.1, dropped = *count, "aligner bucket overflow");
            }
            rings = self.rings.lock();
            rings.get_mut(&key).unwrap().push_back(envelope);
        } else {
            ring.push_back(envelope);
        }
        drop(rings);
        self.last_active.lock().insert(key.0.clone(), key);
    }

    /// Attempt one alignment round. Returns `None` (and leaves every
    /// bucket untouched) if any declared kind lacks a usable message yet —
    /// this is the transient `AlignmentPending` condition; it is never an
    /// error, the worker just tries again next tick.
    fn try_select(&self, declared: &[String], max_diff: f64) -> Option<HashMap<String, Envelope>> {
        let last_active = self.last_active.lock();
        let mut keys = Vec::with_capacity(declared.len());
        for kind in declared {
            keys.push(last_active.get(kind).cloned()?);
        }
        drop(last_active);

        let rings = self.rings.lock();
        let mut newest_per_kind = Vec::with_capacity(keys.len());
        for key in &keys {
            let newest = rings.get(key)?.back()?.timestamp_secs;
            newest_per_kind.push(newest);
        }
        let reference = newest_per_kind.iter().copied().fold(f64::INFINITY, f64::min);

        let mut selected_indices = Vec::with_capacity(keys.len());
        for key in &keys {
            let ring = rings.get(key)?;
            let index = ring
                .iter()
                .enumerate()
                .rev()
                .find(|(_, m)| (m.timestamp_secs - reference).abs() <= max_diff)
                .map(|(i, _)| i)?;
            selected_indices.push(index);
        }
        drop(rings);

        let mut rings = self.rings.lock();
        let mut result = HashMap::with_capacity(declared.len());
        for ((kind, key), index) in declared.iter().zip(keys.iter()).zip(selected_indices.iter()) {
            let ring = rings.get_mut(key).expect("bucket existed under read lock");
            let message = ring.remove(*index).expect("index selected under read lock");
            result.insert(kind.clone(), message);
        }
        Some(result)
    }
}

struct AlignerAdapter<A: AlignerLogic> {
    logic: A,
    buckets: Arc<Buckets>,
    new_data: Arc<Notify>,
}

#[async_trait]
impl<A: AlignerLogic> Component for AlignerAdapter<A> {
    fn declared_inputs(&self) -> &[String] {
        self.logic.declared_inputs()
    }

    fn output_kind(&self) -> &str {
        self.logic.output_kind()
    }

    async fn on_message(&self, message: Envelope) -> Result<()> {
        self.buckets.push(message);
        self.new_data.notify_one();
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.logic.cleanup().await
    }
}

/// Drives an [`AlignerLogic`]: owns the per-source rings, the extra
/// subscriptions a pipeline wires up via [`Self::connect_input`], and the
/// background alignment worker.
pub struct Aligner<A: AlignerLogic + 'static> {
    base: Arc<ComponentBase<AlignerAdapter<A>>>,
    buckets: Arc<Buckets>,
    new_data: Arc<Notify>,
    max_timestamp_diff: f64,
    extra_subscriptions: Mutex<Vec<SubscriptionToken>>,
}

impl<A: AlignerLogic + 'static> Aligner<A> {
    pub fn new(bus: Arc<dyn BusAdapter>, spec: ComponentSpec, logic: A) -> Self {
        let buckets = Arc::new(Buckets::default());
        let new_data = Arc::new(Notify::new());
        let base = ComponentBase::new(
            bus,
            spec,
            AlignerAdapter {
                logic,
                buckets: buckets.clone(),
                new_data: new_data.clone(),
            },
        );
        Self {
            base,
            buckets,
            new_data,
            max_timestamp_diff: DEFAULT_MAX_TIMESTAMP_DIFF_SECONDS,
            extra_subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_timestamp_diff(mut self, seconds: f64) -> Self {
        self.max_timestamp_diff = seconds;
        self
    }

    pub fn base(&self) -> &Arc<ComponentBase<AlignerAdapter<A>>> {
        &self.base
    }

    /// Subscribe this service's alignment buckets to an additional channel
    /// — what `Connector::connect` drives on the manager side when wiring
    /// one component's output into this service's input (SPEC_FULL.md
    /// §4.G).
    pub async fn connect_input(&self, channel: &str) -> Result<()> {
        let buckets = self.buckets.clone();
        let new_data = self.new_data.clone();
        let token = self
            .base
            .bus()
            .subscribe(
                channel,
                Box::new(move |bytes| {
                    let Ok(envelope) = frame::decode(&bytes) else { return };
                    buckets.push(envelope);
                    new_data.notify_one();
                }),
            )
            .await?;
        self.extra_subscriptions.lock().push(token);
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.base.spawn_trivial_worker();
        self.base.start().await?;
        self.spawn_alignment_loop();
        Ok(())
    }

    fn spawn_alignment_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let declared = this.base.component().logic.declared_inputs().to_vec();
            loop {
                if this.base.stop_requested().load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                if let Some(inputs) = this.buckets.try_select(&declared, this.max_timestamp_diff) {
                    let reference = inputs
                        .values()
                        .map(|m| m.timestamp_secs)
                        .fold(f64::INFINITY, f64::min);
                    match this.base.component().logic.execute(inputs).await {
                        Ok(Some(mut output)) => {
                            output.timestamp_secs = reference;
                            if let Err(e) = this.base.publish(output).await {
                                tracing::error!(error = %e, "aligner failed to publish output");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "aligner execute() failed");
                        }
                    }
                } else {
                    tracing::trace!(target: conduit_log::FRAMEWORK_TARGET, "alignment pending");
                }

                tokio::select! {
                    _ = this.base.stop_notify().notified() => break,
                    _ = this.new_data.notified() => {}
                    _ = tokio::time::sleep(ALIGNMENT_POLL_INTERVAL) => {}
                }
            }
            this.base.confirm_stopped();
        });
    }

    pub async fn stop(&self) -> Result<()> {
        for token in self.extra_subscriptions.lock().drain(..).collect::<Vec<_>>() {
            let _ = self.base.bus().unsubscribe(token).await;
        }
        self.base.stop().await
    }
}

/// Wraps an [`Aligner`] behind an `Arc` so it satisfies [`RunningComponent`]
/// — `Aligner::start` needs `self: &Arc<Self>` to spawn its alignment
/// worker, which `dyn RunningComponent::start(&self)` can't express
/// directly.
pub struct AlignerHandle<A: AlignerLogic + 'static> {
    aligner: Arc<Aligner<A>>,
}

impl<A: AlignerLogic + 'static> AlignerHandle<A> {
    pub fn new(aligner: Arc<Aligner<A>>) -> Self {
        Self { aligner }
    }

    pub fn aligner(&self) -> &Arc<Aligner<A>> {
        &self.aligner
    }
}

#[async_trait]
impl<A: AlignerLogic + 'static> RunningComponent for AlignerHandle<A> {
    async fn start(&self) -> Result<()> {
        self.aligner.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.aligner.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_bus::InMemoryBus;
    use conduit_core::message::kind;

    struct SumText;

    #[async_trait]
    impl AlignerLogic for SumText {
        fn declared_inputs(&self) -> &[String] {
            static INPUTS: std::sync::OnceLock<Vec<String>> = std::sync::OnceLock::new();
            INPUTS.get_or_init(|| vec!["a".to_string(), "b".to_string()])
        }

        fn output_kind(&self) -> &str {
            kind::TEXT_MESSAGE
        }

        async fn execute(&self, inputs: HashMap<String, Envelope>) -> Result<Option<Envelope>> {
            let a = inputs["a"].decode_payload::<String>().unwrap_or_default();
            let b = inputs["b"].decode_payload::<String>().unwrap_or_default();
            Ok(Some(Envelope::new(
                kind::TEXT_MESSAGE,
                serde_json::json!(format!("{a}{b}")),
            )))
        }
    }

    fn spec() -> ComponentSpec {
        ComponentSpec::new("Aligner", "10.0.0.3")
    }

    fn msg(kind: &str, source: &str, ts: f64, body: &str) -> Envelope {
        Envelope::new(kind, serde_json::json!(body))
            .with_timestamp(ts)
            .with_previous_component(source)
    }

    #[tokio::test]
    async fn aligns_within_max_diff_and_computes_reference_timestamp() {
        let bus = InMemoryBus::new();
        let aligner = Arc::new(Aligner::new(bus.clone(), spec(), SumText));
        aligner.start().await.unwrap();

        let output: Arc<parking_lot::Mutex<Vec<Envelope>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o = output.clone();
        bus.subscribe(
            &spec().output_channel(),
            Box::new(move |bytes| {
                if let Ok(env) = frame::decode(&bytes) {
                    o.lock().push(env);
                }
            }),
        )
        .await
        .unwrap();

        aligner
            .base
            .publish(Envelope::new("noop", serde_json::json!({})))
            .await
            .ok();

        // Feed directly via the base's own message handling path.
        let a = msg("a", "Source", 10.0, "hi");
        let b = msg("b", "Source", 10.2, "!");
        bus.publish(&spec().input_channel(), frame::encode(&a).unwrap())
            .await
            .unwrap();
        bus.publish(&spec().input_channel(), frame::encode(&b).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let got = output.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp_secs, 10.0);

        aligner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exceeding_max_diff_defers_alignment() {
        let bus = InMemoryBus::new();
        let aligner = Arc::new(Aligner::new(bus.clone(), spec(), SumText).with_max_timestamp_diff(0.5));
        aligner.start().await.unwrap();

        let a = msg("a", "Source", 11.0, "hi");
        let b = msg("b", "Source", 12.0, "!");
        bus.publish(&spec().input_channel(), frame::encode(&a).unwrap())
            .await
            .unwrap();
        bus.publish(&spec().input_channel(), frame::encode(&b).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        // Both buckets still hold their message — nothing was consumed.
        assert_eq!(aligner.buckets.rings.lock().values().map(|r| r.len()).sum::<usize>(), 2);

        aligner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn zero_diff_still_aligns_exactly_equal_timestamps() {
        let buckets = Buckets::default();
        buckets.push(msg("a", "Source", 5.0, "x"));
        buckets.push(msg("b", "Source", 5.0, "y"));
        let declared = vec!["a".to_string(), "b".to_string()];
        let selected = buckets.try_select(&declared, 0.0);
        assert!(selected.is_some());
    }

    #[tokio::test]
    async fn bounded_buffer_drops_oldest_and_counts_drops() {
        let buckets = Buckets::default();
        for i in 0..(MAX_MESSAGE_BUFFER_SIZE + 5) {
            buckets.push(msg("a", "Source", i as f64, "x"));
        }
        let rings = buckets.rings.lock();
        let ring = rings.get(&("a".to_string(), "Source".to_string())).unwrap();
        assert_eq!(ring.len(), MAX_MESSAGE_BUFFER_SIZE);
        drop(rings);
        let counts = buckets.drop_counts.lock();
        assert_eq!(*counts.get(&("a".to_string(), "Source".to_string())).unwrap(), 5);
    }
}
