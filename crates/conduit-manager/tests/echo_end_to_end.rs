//! End-to-end seed scenarios from SPEC_FULL.md §8, driven through the real
//! `ComponentManager` + `Connector` pair rather than either one's own unit
//! tests in isolation. Runs against `InMemoryBus` — no broker required.

use std::time::Duration;

use async_trait::async_trait;
use conduit_bus::InMemoryBus;
use conduit_component::Component;
use conduit_connector::{Connector, ConnectorSpec};
use conduit_core::{channel, ControlPayload, Envelope, Error, Result};
use conduit_manager::{ComponentFactory, ComponentManager};

struct Echo;

#[async_trait]
impl Component for Echo {
    fn declared_inputs(&self) -> &[String] {
        &[]
    }

    fn output_kind(&self) -> &str {
        conduit_core::message::kind::TEXT_MESSAGE
    }

    async fn on_request(&self, request: Envelope) -> Result<Envelope> {
        let ControlPayload::TextRequest { text } = request.decode_payload()? else {
            return Err(Error::MessageTypeRejected {
                kind: request.kind,
                component: "Echo".into(),
            });
        };
        Ok(Envelope::new(
            conduit_core::message::kind::TEXT_MESSAGE,
            serde_json::to_value(ControlPayload::TextMessage { text }).unwrap(),
        ))
    }
}

struct Camera;

#[async_trait]
impl Component for Camera {
    fn declared_inputs(&self) -> &[String] {
        &[]
    }

    fn output_kind(&self) -> &str {
        conduit_core::message::kind::TEXT_MESSAGE
    }
}

#[async_trait]
impl conduit_component::SensorComponent for Camera {
    async fn execute(&self) -> Result<Option<Envelope>> {
        Ok(None)
    }
}

/// Scenario 1 (§8): a connector targeting a device with no manager running
/// raises `DeviceUnreachable` within the caller's deadline.
#[tokio::test]
async fn ping_unknown_device_is_unreachable_within_deadline() {
    let bus = InMemoryBus::new();
    let spec = ConnectorSpec::new("Echo", "10.50.0.1").with_startup_timeout(Duration::from_millis(300));

    let started = tokio::time::Instant::now();
    let err = Connector::start(bus, spec).await.unwrap_err();
    assert!(matches!(err, Error::DeviceUnreachable { .. }));
    assert!(started.elapsed() < Duration::from_millis(1100));
}

/// Scenario 2 (§8): start Echo through a real manager, round-trip a text
/// request, and confirm the data-stream descriptor exists while no
/// reservation was taken (Echo is a plain component, not a sensor).
#[tokio::test]
async fn start_and_echo_through_a_real_manager() {
    let bus = InMemoryBus::new();
    let manager = ComponentManager::new(bus.clone(), "10.50.0.2");
    manager.register("Echo", ComponentFactory::plain(|_| Ok(Echo)));
    manager.serve().await.unwrap();

    let spec = ConnectorSpec::new("Echo", "10.50.0.2").with_startup_timeout(Duration::from_secs(2));
    let connector = Connector::start(bus.clone(), spec).await.unwrap();

    let reply = connector
        .request(
            ControlPayload::TextRequest { text: "hi".into() },
            Duration::from_secs(2),
            true,
        )
        .await
        .unwrap()
        .expect("blocking request returns a reply");
    let ControlPayload::TextMessage { text } = ControlPayload::from_envelope(&reply).unwrap() else {
        panic!("expected TextMessage, got {reply:?}");
    };
    assert_eq!(text, "hi");

    let fingerprint = channel::component_channel(&channel::component_id("Echo", "10.50.0.2"), &connector.input_channel());
    assert!(bus.get(&channel::data_stream_key(&fingerprint)).await.unwrap().is_some());
    assert!(bus
        .set_if_absent(&channel::reservation_key("Echo:10.50.0.2"), "probe")
        .await
        .unwrap());

    connector.stop().await.unwrap();
}

/// Scenario 3 (§8): two connectors requesting the same exclusive sensor on
/// one device — the first succeeds, the second is told why it failed.
#[tokio::test]
async fn second_connector_requesting_the_same_sensor_gets_reservation_conflict() {
    let bus = InMemoryBus::new();
    let manager = ComponentManager::new(bus.clone(), "10.50.0.3");
    manager.register("Camera", ComponentFactory::sensor(|_| Ok(Camera)));
    manager.serve().await.unwrap();

    let first = Connector::start(
        bus.clone(),
        ConnectorSpec::new("Camera", "10.50.0.3")
            .with_client_id("client-a")
            .with_startup_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    let err = Connector::start(
        bus.clone(),
        ConnectorSpec::new("Camera", "10.50.0.3")
            .with_client_id("client-b")
            .with_startup_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap_err();

    let Error::ComponentNotStarted { reason } = err else {
        panic!("expected ComponentNotStarted, got {err:?}");
    };
    assert!(reason.contains("reservation"));

    first.stop().await.unwrap();
}

/// Scenario 6 (§8), narrowed to one manager: after `StopManager`, every
/// component it started is `Stopped`/cleaned and every `data_stream:*` key
/// for that manager's components is gone.
#[tokio::test]
async fn stop_manager_tears_down_every_component_it_started() {
    let bus = InMemoryBus::new();
    let manager = ComponentManager::new(bus.clone(), "10.50.0.4");
    manager.register("Echo", ComponentFactory::plain(|_| Ok(Echo)));
    manager.register("Camera", ComponentFactory::sensor(|_| Ok(Camera)));
    manager.serve().await.unwrap();

    let echo = Connector::start(
        bus.clone(),
        ConnectorSpec::new("Echo", "10.50.0.4").with_startup_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();
    let camera = Connector::start(
        bus.clone(),
        ConnectorSpec::new("Camera", "10.50.0.4").with_startup_timeout(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    let echo_fp = channel::component_channel(&channel::component_id("Echo", "10.50.0.4"), &echo.input_channel());
    let camera_fp = channel::component_channel(&channel::component_id("Camera", "10.50.0.4"), &camera.input_channel());
    assert!(bus.get(&channel::data_stream_key(&echo_fp)).await.unwrap().is_some());
    assert!(bus.get(&channel::data_stream_key(&camera_fp)).await.unwrap().is_some());

    let stop_signal = manager.stop_signal();
    let notified = stop_signal.notified();
    tokio::pin!(notified);

    // Drive StopManager the way a connector-side admin call would: publish
    // it directly on the manager channel and wait for the signal it sets.
    // The components themselves are never asked to stop individually here —
    // `manager.shutdown()` below is what must tear both of them down.
    let req = ControlPayload::StopRequest.into_envelope().unwrap().with_request_id(99);
    bus.publish(
        &channel::manager_channel("10.50.0.4"),
        conduit_core::frame::encode(&req).unwrap(),
    )
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(1), notified).await.unwrap();

    manager.shutdown().await.unwrap();

    assert!(bus.get(&channel::data_stream_key(&echo_fp)).await.unwrap().is_none());
    assert!(bus.get(&channel::data_stream_key(&camera_fp)).await.unwrap().is_none());
    assert!(bus
        .set_if_absent(&channel::reservation_key("Camera:10.50.0.4"), "probe")
        .await
        .unwrap());
}
