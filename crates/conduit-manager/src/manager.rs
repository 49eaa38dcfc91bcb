//! Per-device component supervisor (SPEC_FULL.md §4.F): the sole request
//! handler on the channel named after its device IP, dispatching `Ping`,
//! `StopManager` (carried as a plain `stop_request`, same kind a component
//! uses for its own shutdown), `StartComponent`, and `StopComponent`.

use std::sync::Arc;

use conduit_bus::BusAdapter;
use conduit_component::{ComponentSpec, RunningComponent};
use conduit_core::{channel, frame, message::kind, ControlPayload, Envelope, Result, IGNORE_REQUEST_ID};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::factory::ComponentFactory;

/// Logged at `INFO` once the manager's request channel is live. Operators
/// tailing logs can grep for it; `conduit-connector` itself prefers `Ping`
/// (SPEC_FULL.md §6) and never scrapes this line.
pub const MANAGER_STARTED_MARKER: &str = "STARTED COMPONENT MANAGER";

/// One running instance and the bookkeeping the manager needs to tear it
/// down cleanly: who owns it, whether it is exclusive (sensor/actuator) or
/// shared (plain component/service), and the set of data-stream descriptor
/// keys recorded against it (one per distinct `inputChannel` a client has
/// supplied, per SPEC_FULL.md §6).
struct LiveComponent {
    instance: Arc<dyn RunningComponent>,
    owner_client_id: String,
    output_channel: String,
    request_reply_channel: String,
    component_id: String,
    exclusive: bool,
    data_stream_keys: Mutex<Vec<String>>,
}

pub struct ComponentManager {
    bus: Arc<dyn BusAdapter>,
    device_ip: String,
    factories: DashMap<String, ComponentFactory>,
    live: DashMap<String, Arc<LiveComponent>>,
    stop_notify: Arc<Notify>,
}

impl ComponentManager {
    pub fn new(bus: Arc<dyn BusAdapter>, device_ip: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            device_ip: device_ip.into(),
            factories: DashMap::new(),
            live: DashMap::new(),
            stop_notify: Arc::new(Notify::new()),
        })
    }

    pub fn device_ip(&self) -> &str {
        &self.device_ip
    }

    /// Add a constructible component kind. Names are the "class-name
    /// dispatch" key a `StartComponentRequest` uses to pick one.
    pub fn register(&self, name: impl Into<String>, factory: ComponentFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// A signal callers can wait on to learn `StopManager` was requested.
    pub fn stop_signal(&self) -> Arc<Notify> {
        self.stop_notify.clone()
    }

    /// Subscribe on `manager_channel(device_ip)` and start dispatching
    /// requests. Each request runs on its own task, matching the dispatch
    /// pattern every `ComponentBase` subscription already uses.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        self.bus
            .subscribe(
                &channel::manager_channel(&self.device_ip),
                Box::new(move |bytes| {
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.handle_request(bytes).await;
                    });
                }),
            )
            .await?;
        tracing::info!(device_ip = %self.device_ip, "{}", MANAGER_STARTED_MARKER);
        Ok(())
    }

    async fn handle_request(self: &Arc<Self>, bytes: Vec<u8>) {
        let envelope = match frame::decode(&bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "manager failed to decode request");
                return;
            }
        };
        if !envelope.is_request() {
            return;
        }

        let reply_channel = channel::manager_channel(&self.device_ip);
        let request_id = envelope.request_id;

        let reply = match envelope.kind.as_str() {
            kind::PING => Envelope::new(kind::PONG, serde_json::json!({})),
            kind::STOP_REQUEST => {
                self.stop_notify.notify_waiters();
                Envelope::new(kind::SUCCESS, serde_json::to_value(ControlPayload::Success).unwrap())
            }
            kind::START_COMPONENT_REQUEST => self.handle_start(&envelope).await,
            kind::STOP_COMPONENT_REQUEST => self.handle_stop(&envelope).await,
            other => {
                tracing::warn!(kind = %other, "manager rejected unrecognized request kind");
                return;
            }
        };

        if let Ok(bytes) = frame::encode(&reply.stamp_reply(request_id)) {
            if let Err(e) = self.bus.publish(&reply_channel, bytes).await {
                tracing::error!(error = %e, "manager failed to publish reply");
            }
        }
    }

    async fn handle_start(&self, envelope: &Envelope) -> Envelope {
        let (component_name, input_channel, client_id, config) = match ControlPayload::from_envelope(envelope) {
            Ok(ControlPayload::StartComponentRequest {
                component_name,
                input_channel,
                client_id,
                config,
            }) => (component_name, input_channel, client_id, config),
            _ => return not_started("malformed start_component_request"),
        };

        let Some(factory) = self.factories.get(&component_name).map(|f| f.clone()) else {
            return not_started(format!("no constructible component named '{component_name}'"));
        };

        let spec = ComponentSpec::new(component_name, self.device_ip.clone()).with_client_id(client_id.clone());
        let output_channel = spec.output_channel();
        let component_id = spec.component_id();

        // Idempotent-Start / shared-instance resolution (§8): a repeat
        // request from the same client always succeeds against the live
        // instance; a different client piggybacks too if the kind isn't
        // exclusive hardware. Only an exclusive kind already owned by
        // someone else is a conflict.
        let existing = self.live.get(&output_channel).map(|c| c.clone());
        if let Some(existing) = existing {
            if existing.owner_client_id == client_id || !existing.exclusive {
                self.record_data_stream(&existing, &component_id, &input_channel, &client_id)
                    .await;
                return component_started(&existing.output_channel, &existing.request_reply_channel);
            }
            return not_started(format!("component '{component_id}' reservation is held by another client"));
        }

        let instance = match factory.build(self.bus.clone(), spec.clone(), config).await {
            Ok(instance) => instance,
            Err(e) => return not_started(e.to_string()),
        };

        let live = Arc::new(LiveComponent {
            instance,
            owner_client_id: client_id.clone(),
            output_channel: output_channel.clone(),
            request_reply_channel: spec.request_reply_channel(),
            component_id: component_id.clone(),
            exclusive: factory.exclusive,
            data_stream_keys: Mutex::new(Vec::new()),
        });
        self.live.insert(output_channel.clone(), live.clone());
        self.record_data_stream(&live, &component_id, &input_channel, &client_id).await;

        component_started(&live.output_channel, &live.request_reply_channel)
    }

    async fn record_data_stream(&self, live: &LiveComponent, component_id: &str, input_channel: &str, client_id: &str) {
        let key = channel::component_channel(component_id, input_channel);
        let descriptor = serde_json::json!({
            "componentEndpoint": component_id,
            "inputChannel": input_channel,
            "clientId": client_id,
        });
        if let Err(e) = self.bus.put(&channel::data_stream_key(&key), descriptor).await {
            tracing::error!(error = %e, "failed to record data-stream descriptor");
            return;
        }
        live.data_stream_keys.lock().push(key);
    }

    async fn handle_stop(&self, envelope: &Envelope) -> Envelope {
        let output_channel = match ControlPayload::from_envelope(envelope) {
            Ok(ControlPayload::StopComponentRequest { output_channel }) => output_channel,
            _ => return ignore(),
        };

        let Some((_, live)) = self.live.remove(&output_channel) else {
            return ignore();
        };

        if let Err(e) = live.instance.stop().await {
            tracing::error!(error = %e, component_id = %live.component_id, "error stopping component");
        }
        for key in live.data_stream_keys.lock().drain(..).collect::<Vec<_>>() {
            let _ = self.bus.delete_key(&channel::data_stream_key(&key)).await;
        }

        Envelope::new(kind::SUCCESS, serde_json::to_value(ControlPayload::Success).unwrap())
    }

    /// Stop every live component (concurrently, since each instance's
    /// shutdown is independent), release the manager's own reservation
    /// namespace, and close the bus. Safe to call once after `serve`.
    pub async fn shutdown(&self) -> Result<()> {
        let live: Vec<Arc<LiveComponent>> = self.live.iter().map(|e| e.value().clone()).collect();
        self.live.clear();

        let bus = &self.bus;
        futures::future::join_all(live.into_iter().map(|c| async move {
            if let Err(e) = c.instance.stop().await {
                tracing::error!(error = %e, component_id = %c.component_id, "error stopping component during shutdown");
            }
            for key in c.data_stream_keys.lock().drain(..).collect::<Vec<_>>() {
                let _ = bus.delete_key(&channel::data_stream_key(&key)).await;
            }
        }))
        .await;

        let _ = self.bus.delete(&channel::reservation_key(&self.device_ip)).await;
        self.bus.close().await?;
        Ok(())
    }
}

fn not_started(reason: impl Into<String>) -> Envelope {
    Envelope::new(
        kind::NOT_STARTED,
        serde_json::to_value(ControlPayload::NotStarted { reason: reason.into() }).unwrap(),
    )
}

fn component_started(output_channel: &str, request_reply_channel: &str) -> Envelope {
    Envelope::new(
        kind::COMPONENT_STARTED,
        serde_json::to_value(ControlPayload::ComponentStarted {
            output_channel: output_channel.to_string(),
            request_reply_channel: request_reply_channel.to_string(),
        })
        .unwrap(),
    )
}

/// `StopComponent` on an id the manager never started: the request is
/// dropped in-band rather than erroring, via the `-1` sentinel so the
/// caller's wait simply times out rather than matching a spurious reply.
fn ignore() -> Envelope {
    Envelope::new(kind::IGNORE, serde_json::json!({})).with_request_id(IGNORE_REQUEST_ID)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_bus::InMemoryBus;
    use conduit_component::Component;
    use conduit_core::{message::kind, Error};
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl Component for Echo {
        fn declared_inputs(&self) -> &[String] {
            &[]
        }
        fn output_kind(&self) -> &str {
            kind::TEXT_MESSAGE
        }
        async fn on_request(&self, request: Envelope) -> Result<Envelope> {
            let ControlPayload::TextRequest { text } = request.decode_payload()? else {
                return Err(Error::MessageTypeRejected {
                    kind: request.kind,
                    component: "Echo".into(),
                });
            };
            Ok(Envelope::new(
                kind::TEXT_MESSAGE,
                serde_json::to_value(ControlPayload::TextMessage { text }).unwrap(),
            ))
        }
    }

    struct Counter;

    #[async_trait::async_trait]
    impl Component for Counter {
        fn declared_inputs(&self) -> &[String] {
            &[]
        }
        fn output_kind(&self) -> &str {
            kind::TEXT_MESSAGE
        }
    }

    #[async_trait::async_trait]
    impl conduit_component::SensorComponent for Counter {
        async fn execute(&self) -> Result<Option<Envelope>> {
            Ok(None)
        }
    }

    async fn request(bus: &Arc<InMemoryBus>, channel: &str, payload: ControlPayload, request_id: i64) -> Envelope {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Arc::new(parking_lot::Mutex::new(Some(tx)));
        let token = bus
            .subscribe(
                channel,
                Box::new(move |bytes| {
                    if let Ok(env) = frame::decode(&bytes) {
                        if !env.is_request() && env.request_id == request_id {
                            if let Some(tx) = tx.lock().take() {
                                let _ = tx.send(env);
                            }
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let req = payload.into_envelope().unwrap().with_request_id(request_id);
        bus.publish(channel, frame::encode(&req).unwrap()).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        bus.unsubscribe(token).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn ping_replies_pong() {
        let bus = InMemoryBus::new();
        let manager = ComponentManager::new(bus.clone(), "10.0.0.4");
        manager.serve().await.unwrap();

        let reply = request(&bus, "10.0.0.4", ControlPayload::Ping, 42).await;
        assert_eq!(reply.kind, kind::PONG);
    }

    #[tokio::test]
    async fn start_unknown_component_replies_not_started() {
        let bus = InMemoryBus::new();
        let manager = ComponentManager::new(bus.clone(), "10.0.0.4");
        manager.serve().await.unwrap();

        let reply = request(
            &bus,
            "10.0.0.4",
            ControlPayload::StartComponentRequest {
                component_name: "Nope".into(),
                input_channel: "x".into(),
                client_id: "c1".into(),
                config: serde_json::json!({}),
            },
            1,
        )
        .await;
        assert_eq!(reply.kind, kind::NOT_STARTED);
    }

    #[tokio::test]
    async fn start_echo_then_stop_clears_data_stream_and_live_set() {
        let bus = InMemoryBus::new();
        let manager = ComponentManager::new(bus.clone(), "10.0.0.5");
        manager.register("Echo", ComponentFactory::plain(|_| Ok(Echo)));
        manager.serve().await.unwrap();

        let reply = request(
            &bus,
            "10.0.0.5",
            ControlPayload::StartComponentRequest {
                component_name: "Echo".into(),
                input_channel: "client-1".into(),
                client_id: "c1".into(),
                config: serde_json::json!({}),
            },
            7,
        )
        .await;
        let ControlPayload::ComponentStarted {
            output_channel,
            request_reply_channel,
        } = ControlPayload::from_envelope(&reply).unwrap()
        else {
            panic!("expected ComponentStarted, got {reply:?}");
        };
        assert_eq!(output_channel, "Echo:10.0.0.5");
        assert_eq!(request_reply_channel, "Echo:reqreply:10.0.0.5");

        let fingerprint = channel::component_channel(&channel::component_id("Echo", "10.0.0.5"), "client-1");
        assert!(bus.get(&channel::data_stream_key(&fingerprint)).await.unwrap().is_some());

        let reply = request(
            &bus,
            "10.0.0.5",
            ControlPayload::StopComponentRequest {
                output_channel: output_channel.clone(),
            },
            8,
        )
        .await;
        assert_eq!(reply.kind, kind::SUCCESS);
        assert!(bus.get(&channel::data_stream_key(&fingerprint)).await.unwrap().is_none());

        // Unknown id after stop: ignored rather than erroring.
        let reply = request(
            &bus,
            "10.0.0.5",
            ControlPayload::StopComponentRequest { output_channel },
            9,
        )
        .await;
        assert_eq!(reply.kind, kind::IGNORE);
    }

    #[tokio::test]
    async fn repeat_start_from_same_client_is_idempotent() {
        let bus = InMemoryBus::new();
        let manager = ComponentManager::new(bus.clone(), "10.0.0.6");
        manager.register(
            "Camera",
            ComponentFactory::sensor(|_| Ok(Counter)),
        );
        manager.serve().await.unwrap();

        let start = ControlPayload::StartComponentRequest {
            component_name: "Camera".into(),
            input_channel: "client-1".into(),
            client_id: "c1".into(),
            config: serde_json::json!({}),
        };

        let first = request(&bus, "10.0.0.6", start.clone(), 1).await;
        assert_eq!(first.kind, kind::COMPONENT_STARTED);

        let second = request(&bus, "10.0.0.6", start, 2).await;
        assert_eq!(second.kind, kind::COMPONENT_STARTED);
    }

    #[tokio::test]
    async fn second_client_requesting_exclusive_component_gets_reservation_conflict() {
        let bus = InMemoryBus::new();
        let manager = ComponentManager::new(bus.clone(), "10.0.0.7");
        manager.register("Camera", ComponentFactory::sensor(|_| Ok(Counter)));
        manager.serve().await.unwrap();

        let first = request(
            &bus,
            "10.0.0.7",
            ControlPayload::StartComponentRequest {
                component_name: "Camera".into(),
                input_channel: "a".into(),
                client_id: "client-a".into(),
                config: serde_json::json!({}),
            },
            1,
        )
        .await;
        assert_eq!(first.kind, kind::COMPONENT_STARTED);

        let second = request(
            &bus,
            "10.0.0.7",
            ControlPayload::StartComponentRequest {
                component_name: "Camera".into(),
                input_channel: "b".into(),
                client_id: "client-b".into(),
                config: serde_json::json!({}),
            },
            2,
        )
        .await;
        let ControlPayload::NotStarted { reason } = ControlPayload::from_envelope(&second).unwrap() else {
            panic!("expected NotStarted, got {second:?}");
        };
        assert!(reason.contains("reservation"));
    }

    #[tokio::test]
    async fn stop_manager_notifies_stop_signal() {
        let bus = InMemoryBus::new();
        let manager = ComponentManager::new(bus.clone(), "10.0.0.8");
        let signal = manager.stop_signal();
        manager.serve().await.unwrap();

        let notified = signal.notified();
        tokio::pin!(notified);

        let reply = request(&bus, "10.0.0.8", ControlPayload::StopRequest, 1).await;
        assert_eq!(reply.kind, kind::SUCCESS);
        tokio::time::timeout(Duration::from_secs(1), notified).await.unwrap();
    }
}
