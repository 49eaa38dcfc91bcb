//! Sensor specialization: a component whose output comes from repeatedly
//! sampling hardware rather than reacting to requests (SPEC_FULL.md §4.D).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use conduit_bus::BusAdapter;
use conduit_core::{channel, Error, Result};

use crate::base::{ComponentBase, ComponentSpec};
use crate::component::SensorComponent;
use crate::lifecycle::Lifecycle;
use crate::runtime::RunningComponent;

const EXECUTE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wraps a [`ComponentBase`] with reservation acquisition and a background
/// `execute()` loop. At most one `SensorBase` per `component_id` can hold
/// the reservation at a time (Invariant 5, SPEC_FULL.md §8).
pub struct SensorBase<S: SensorComponent + 'static> {
    base: Arc<ComponentBase<S>>,
}

impl<S: SensorComponent + 'static> SensorBase<S> {
    pub fn new(bus: Arc<dyn BusAdapter>, spec: ComponentSpec, component: S) -> Self {
        Self {
            base: ComponentBase::new(bus, spec, component),
        }
    }

    pub fn base(&self) -> &Arc<ComponentBase<S>> {
        &self.base
    }

    pub fn state(&self) -> Lifecycle {
        self.base.state()
    }

    fn reservation_key(&self) -> String {
        channel::reservation_key(&self.base.spec().component_id())
    }

    /// Acquire the exclusive-hardware reservation, register handlers, spawn
    /// the execute loop, and transition to `Ready`. Fails with
    /// [`Error::ReservationConflict`] before anything else if another
    /// client already holds the reservation.
    pub async fn start(&self) -> Result<()> {
        let key = self.reservation_key();
        let acquired = self.base.bus.set_if_absent(&key, &self.base.spec().client_id).await?;
        if !acquired {
            return Err(Error::ReservationConflict {
                component_id: self.base.spec().component_id(),
            });
        }

        self.base.start().await?;
        self.spawn_execute_loop();
        Ok(())
    }

    fn spawn_execute_loop(&self) {
        let base = self.base.clone();
        tokio::spawn(async move {
            loop {
                if base.stop_requested.load(Ordering::SeqCst) {
                    break;
                }
                match base.component.execute().await {
                    Ok(Some(mut message)) => {
                        if let Ok(time) = base.bus.time().await {
                            message.timestamp_secs = time.as_secs_f64();
                        }
                        if let Err(e) = base.publish(message).await {
                            tracing::error!(component = %base.spec().name, error = %e, "sensor failed to publish output");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(component = %base.spec().name, error = %e, "sensor execute() failed");
                    }
                }

                tokio::select! {
                    _ = base.stop_notify.notified() => break,
                    _ = tokio::time::sleep(EXECUTE_POLL_INTERVAL) => {}
                }
            }
            base.confirm_stopped();
        });
    }

    /// Stop the execute loop, drain in-flight calls, run cleanup, then
    /// release the reservation.
    pub async fn stop(&self) -> Result<()> {
        self.base.stop().await?;
        self.base.bus.delete(&self.reservation_key()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: SensorComponent + 'static> RunningComponent for SensorBase<S> {
    async fn start(&self) -> Result<()> {
        SensorBase::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        SensorBase::stop(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_bus::InMemoryBus;
    use conduit_core::{message::kind, Envelope};
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct Counter(Arc<AtomicU64>);

    #[async_trait]
    impl crate::component::Component for Counter {
        fn declared_inputs(&self) -> &[String] {
            &[]
        }
        fn output_kind(&self) -> &str {
            kind::TEXT_MESSAGE
        }
    }

    #[async_trait]
    impl SensorComponent for Counter {
        async fn execute(&self) -> Result<Option<Envelope>> {
            let n = self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Some(Envelope::new(
                kind::TEXT_MESSAGE,
                serde_json::json!({ "kind": "text_message", "text": n.to_string() }),
            )))
        }
    }

    fn spec() -> ComponentSpec {
        ComponentSpec::new("Camera", "10.0.0.5").with_stop_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn second_start_on_same_id_conflicts() {
        let bus = InMemoryBus::new();
        let sensor_a = SensorBase::new(bus.clone(), spec(), Counter(Arc::new(AtomicU64::new(0))));
        sensor_a.start().await.unwrap();

        let sensor_b = SensorBase::new(bus.clone(), spec(), Counter(Arc::new(AtomicU64::new(0))));
        let err = sensor_b.start().await.unwrap_err();
        assert!(matches!(err, Error::ReservationConflict { .. }));

        sensor_a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_the_reservation() {
        let bus = InMemoryBus::new();
        let sensor = SensorBase::new(bus.clone(), spec(), Counter(Arc::new(AtomicU64::new(0))));
        sensor.start().await.unwrap();
        sensor.stop().await.unwrap();

        let key = channel::reservation_key(&spec().component_id());
        assert!(bus.set_if_absent(&key, "someone-else").await.unwrap());
    }

    #[tokio::test]
    async fn execute_output_is_stamped_with_broker_time_and_published() {
        let bus = InMemoryBus::new();
        let received: Arc<parking_lot::Mutex<Vec<Envelope>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let r = received.clone();
        bus.subscribe(
            &spec().output_channel(),
            Box::new(move |bytes| {
                if let Ok(env) = conduit_core::frame::decode(&bytes) {
                    r.lock().push(env);
                }
            }),
        )
        .await
        .unwrap();

        let sensor = SensorBase::new(bus.clone(), spec(), Counter(Arc::new(AtomicU64::new(0))));
        sensor.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        sensor.stop().await.unwrap();

        let got = received.lock();
        assert!(!got.is_empty());
        assert!(got[0].timestamp_secs > 0.0);
    }
}
