//! Client-side proxy to a remote component (SPEC_FULL.md §4.G): locates the
//! manager on a device, starts (or adopts an already-running) component,
//! and exposes the small send/request/subscribe surface a user program
//! drives a pipeline with.

mod request;

pub use request::{request_reply, RequestOutcome};

use std::sync::Arc;
use std::time::Duration;

use conduit_bus::{BusAdapter, MessageHandler, SubscriptionToken};
use conduit_core::message::kind;
use conduit_core::{channel, frame, ControlPayload, ConnectorHandle, Envelope, Error, Result};
use parking_lot::Mutex;

/// Default deadline for the "is it already running" probe (SPEC_FULL.md
/// §4.G step 2).
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity and timing parameters a connector is built from — the
/// client-side mirror of `conduit_component::ComponentSpec`.
#[derive(Debug, Clone)]
pub struct ConnectorSpec {
    pub component_name: String,
    pub device_ip: String,
    pub client_id: String,
    pub startup_timeout: Duration,
    pub config: serde_json::Value,
}

impl ConnectorSpec {
    pub fn new(component_name: impl Into<String>, device_ip: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            device_ip: device_ip.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            startup_timeout: Duration::from_secs(5),
            config: serde_json::json!({}),
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    fn output_channel(&self) -> String {
        channel::output_channel(&self.component_name, &self.device_ip)
    }

    fn request_reply_channel(&self) -> String {
        channel::request_reply_channel(&self.component_name, &self.device_ip)
    }

    fn input_channel(&self) -> String {
        channel::input_channel(&self.component_name, &self.device_ip)
    }

    fn manager_channel(&self) -> String {
        channel::manager_channel(&self.device_ip)
    }
}

/// The client-side proxy to one remote component instance (SPEC_FULL.md
/// §4.G). Borrows a shared bus handle unless constructed with
/// [`Connector::standalone`], in which case it owns the connection and
/// closes it on [`Connector::stop`].
pub struct Connector {
    bus: Arc<dyn BusAdapter>,
    spec: ConnectorSpec,
    owns_bus: bool,
    callbacks: Mutex<Vec<SubscriptionToken>>,
}

impl Connector {
    /// Locate, and start if necessary, the component described by `spec`.
    /// Borrows `bus` — the caller (typically the Application Context) keeps
    /// ownership and closes it once every connector using it is done.
    pub async fn start(bus: Arc<dyn BusAdapter>, spec: ConnectorSpec) -> Result<Self> {
        let connector = Self {
            bus,
            spec,
            owns_bus: false,
            callbacks: Mutex::new(Vec::new()),
        };
        connector.ensure_started().await?;
        Ok(connector)
    }

    /// Like [`Self::start`] but opens and owns its own bus connection — for
    /// a user program operating outside an Application Context
    /// (SPEC_FULL.md §9, bus ownership resolution).
    pub async fn standalone(config: &conduit_core::BusConfig, spec: ConnectorSpec) -> Result<Self> {
        let bus = conduit_bus::RedisBus::connect(config).await?;
        let connector = Self {
            bus,
            spec,
            owns_bus: true,
            callbacks: Mutex::new(Vec::new()),
        };
        connector.ensure_started().await?;
        Ok(connector)
    }

    async fn ensure_started(&self) -> Result<()> {
        let ping = ControlPayload::Ping.into_envelope()?;
        match request_reply(&self.bus, &self.spec.request_reply_channel(), ping, PING_TIMEOUT).await {
            RequestOutcome::Reply(_) => return Ok(()),
            RequestOutcome::Timeout => {}
        }

        let start = ControlPayload::StartComponentRequest {
            component_name: self.spec.component_name.clone(),
            input_channel: self.spec.input_channel(),
            client_id: self.spec.client_id.clone(),
            config: self.spec.config.clone(),
        }
        .into_envelope()?;

        match request_reply(
            &self.bus,
            &self.spec.manager_channel(),
            start,
            self.spec.startup_timeout,
        )
        .await
        {
            RequestOutcome::Timeout => Err(Error::DeviceUnreachable {
                address: self.spec.device_ip.clone(),
                timeout_ms: self.spec.startup_timeout.as_millis() as u64,
            }),
            RequestOutcome::Reply(envelope) => match ControlPayload::from_envelope(&envelope)? {
                ControlPayload::ComponentStarted { .. } => Ok(()),
                ControlPayload::NotStarted { reason } => Err(Error::ComponentNotStarted { reason }),
                unexpected => Err(Error::ComponentNotStarted {
                    reason: format!("unexpected manager reply kind '{}'", unexpected.kind()),
                }),
            },
        }
    }

    pub fn output_channel(&self) -> String {
        self.spec.output_channel()
    }

    pub fn request_reply_channel(&self) -> String {
        self.spec.request_reply_channel()
    }

    pub fn input_channel(&self) -> String {
        self.spec.input_channel()
    }

    /// Stamp `message` with the bus's own clock and publish it on the
    /// user-input channel (SPEC_FULL.md §4.G).
    pub async fn send_message(&self, mut message: Envelope) -> Result<()> {
        let time = self.bus.time().await?;
        message.timestamp_secs = time.as_secs_f64();
        let bytes = frame::encode(&message)?;
        self.bus.publish(&self.spec.input_channel(), bytes).await?;
        Ok(())
    }

    /// Issue a request on the component's request/reply channel.
    ///
    /// When `blocking` is `true`, waits up to `timeout` for a correlated
    /// reply and returns it (or [`Error::RequestTimeout`]). When `false`,
    /// publishes and returns immediately with `Ok(None)` — the caller has
    /// opted out of waiting, matching the at-most-once delivery guarantee
    /// in SPEC_FULL.md §4.G: the request may still be dropped or ignored
    /// (the `-1` sentinel reply) with no further signal to this caller.
    pub async fn request(
        &self,
        payload: ControlPayload,
        timeout: Duration,
        blocking: bool,
    ) -> Result<Option<Envelope>> {
        let envelope = payload.into_envelope()?;
        if !blocking {
            let bytes = frame::encode(&envelope)?;
            self.bus.publish(&self.spec.request_reply_channel(), bytes).await?;
            return Ok(None);
        }

        match request_reply(&self.bus, &self.spec.request_reply_channel(), envelope, timeout).await {
            RequestOutcome::Reply(reply) => Ok(Some(reply)),
            RequestOutcome::Timeout => Err(Error::RequestTimeout),
        }
    }

    /// Subscribe `handler` to this component's output channel. Returns the
    /// token so the caller can unsubscribe independently of
    /// [`Self::stop`]; every still-registered token is also torn down by
    /// `stop()`.
    pub async fn register_callback(
        &self,
        handler: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionToken> {
        let wrapped: MessageHandler = Box::new(move |bytes| {
            if let Ok(envelope) = frame::decode(&bytes) {
                handler(envelope);
            }
        });
        let token = self.bus.subscribe(&self.spec.output_channel(), wrapped).await?;
        self.callbacks.lock().push(token);
        Ok(token)
    }

    /// Ask the remote component to additionally subscribe its input
    /// handling to `other`'s output channel, wiring one pipeline stage's
    /// output into this connector's component (SPEC_FULL.md §4.G).
    pub async fn connect(&self, other: &Connector, timeout: Duration) -> Result<()> {
        let payload = ControlPayload::ConnectInputRequest {
            channel: other.output_channel(),
        }
        .into_envelope()?;
        match request_reply(&self.bus, &self.spec.request_reply_channel(), payload, timeout).await {
            RequestOutcome::Timeout => Err(Error::RequestTimeout),
            RequestOutcome::Reply(reply) => match ControlPayload::from_envelope(&reply)? {
                ControlPayload::Success => Ok(()),
                ControlPayload::NotStarted { reason } => Err(Error::ComponentNotStarted { reason }),
                unexpected => Err(Error::ComponentNotStarted {
                    reason: format!("unexpected connect reply kind '{}'", unexpected.kind()),
                }),
            },
        }
    }

    /// Best-effort: publish `StopRequest` on the request/reply channel
    /// without waiting for an acknowledgment, unsubscribe every registered
    /// callback, and close the bus handle if this connector owns it.
    pub async fn stop(&self) -> Result<()> {
        let envelope = ControlPayload::StopRequest.into_envelope()?;
        let bytes = frame::encode(&envelope)?;
        let _ = self.bus.publish(&self.spec.request_reply_channel(), bytes).await;

        for token in self.callbacks.lock().drain(..).collect::<Vec<_>>() {
            let _ = self.bus.unsubscribe(token).await;
        }

        if self.owns_bus {
            self.bus.close().await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConnectorHandle for Connector {
    async fn stop(&self) -> Result<()> {
        Connector::stop(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_bus::InMemoryBus;
    use std::time::Duration;

    // A minimal manager stand-in: answers Ping and StartComponentRequest
    // directly on the bus, without pulling in `conduit-manager` (that would
    // be a cyclic dev-dependency — manager already depends on connector's
    // sibling crates, not the other way, but keeping the test self-contained
    // avoids coupling this crate's tests to manager internals).
    async fn serve_fake_manager(bus: Arc<InMemoryBus>, device_ip: &str, component_name: &str) {
        let device_ip = device_ip.to_string();
        let component_name = component_name.to_string();
        let b = bus.clone();
        bus.subscribe(
            &channel::manager_channel(&device_ip),
            Box::new(move |bytes| {
                let Ok(envelope) = frame::decode(&bytes) else { return };
                let b = b.clone();
                let component_name = component_name.clone();
                let device_ip = device_ip.clone();
                tokio::spawn(async move {
                    let reply = match envelope.kind.as_str() {
                        kind::START_COMPONENT_REQUEST => ControlPayload::ComponentStarted {
                            output_channel: channel::output_channel(&component_name, &device_ip),
                            request_reply_channel: channel::request_reply_channel(&component_name, &device_ip),
                        }
                        .into_envelope()
                        .unwrap(),
                        kind::PING => ControlPayload::Pong.into_envelope().unwrap(),
                        _ => return,
                    };
                    let bytes = frame::encode(&reply.stamp_reply(envelope.request_id)).unwrap();
                    b.publish(&channel::manager_channel(&device_ip), bytes).await.unwrap();
                });
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ping_unknown_device_raises_device_unreachable() {
        let bus = InMemoryBus::new();
        let spec = ConnectorSpec::new("Echo", "10.9.9.9").with_startup_timeout(Duration::from_millis(200));
        let start = tokio::time::Instant::now();
        let err = Connector::start(bus, spec).await.unwrap_err();
        assert!(matches!(err, Error::DeviceUnreachable { .. }));
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn connects_by_starting_the_component_via_the_manager() {
        let bus = InMemoryBus::new();
        serve_fake_manager(bus.clone(), "10.0.0.20", "Echo").await;

        let spec = ConnectorSpec::new("Echo", "10.0.0.20").with_startup_timeout(Duration::from_secs(2));
        let connector = Connector::start(bus, spec).await.unwrap();
        assert_eq!(connector.output_channel(), "Echo:10.0.0.20");
    }

    #[tokio::test]
    async fn stop_publishes_stop_request_and_is_idempotent() {
        let bus = InMemoryBus::new();
        serve_fake_manager(bus.clone(), "10.0.0.21", "Echo").await;
        let spec = ConnectorSpec::new("Echo", "10.0.0.21").with_startup_timeout(Duration::from_secs(2));
        let connector = Connector::start(bus.clone(), spec).await.unwrap();

        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(
            &connector.request_reply_channel(),
            Box::new(move |bytes| {
                if let Ok(env) = frame::decode(&bytes) {
                    s.lock().push(env);
                }
            }),
        )
        .await
        .unwrap();

        connector.stop().await.unwrap();
        connector.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = seen.lock();
        assert_eq!(got.iter().filter(|e| e.kind == kind::STOP_REQUEST).count(), 2);
    }
}
