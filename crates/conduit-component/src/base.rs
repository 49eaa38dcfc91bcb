//! The lifecycle state machine, input/request dispatch, and in-flight-call
//! tracking every component shares (SPEC_FULL.md §4.D).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit_bus::BusAdapter;
use conduit_core::{channel, frame, ControlPayload, Envelope, Error, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::component::Component;
use crate::lifecycle::Lifecycle;

/// The identity and timing parameters of one component instance, normally
/// filled in by the manager from a `StartComponentRequest` (SPEC_FULL.md
/// §4.F) but constructible directly for standalone use and tests.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    pub name: String,
    pub device_ip: String,
    pub client_id: String,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, device_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_ip: device_ip.into(),
            client_id: String::from("standalone"),
            startup_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
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

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn component_id(&self) -> String {
        channel::component_id(&self.name, &self.device_ip)
    }

    pub fn output_channel(&self) -> String {
        channel::output_channel(&self.name, &self.device_ip)
    }

    pub fn input_channel(&self) -> String {
        channel::input_channel(&self.name, &self.device_ip)
    }

    pub fn request_reply_channel(&self) -> String {
        channel::request_reply_channel(&self.name, &self.device_ip)
    }
}

/// Shared lifecycle plumbing: one input channel, one output channel, one
/// request/reply channel, a `Ready`/`Stopped` state machine, and an
/// active-call counter that gates `cleanup()`. Generic over the
/// [`Component`] implementation it dispatches to.
pub struct ComponentBase<C: Component + 'static> {
    pub(crate) bus: Arc<dyn BusAdapter>,
    pub(crate) spec: ComponentSpec,
    pub(crate) component: Arc<C>,
    lifecycle: RwLock<Lifecycle>,
    pub(crate) stop_requested: Arc<AtomicBool>,
    pub(crate) stop_notify: Arc<Notify>,
    pub(crate) stopped_flag: Arc<AtomicBool>,
    pub(crate) stopped_notify: Arc<Notify>,
    active_calls: Arc<AtomicU64>,
    drained_notify: Arc<Notify>,
    subscriptions: Mutex<Vec<conduit_bus::SubscriptionToken>>,
}

impl<C: Component + 'static> ComponentBase<C> {
    pub fn new(bus: Arc<dyn BusAdapter>, spec: ComponentSpec, component: C) -> Arc<Self> {
        Arc::new(Self {
            bus,
            spec,
            component: Arc::new(component),
            lifecycle: RwLock::new(Lifecycle::Constructed),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
            stopped_flag: Arc::new(AtomicBool::new(false)),
            stopped_notify: Arc::new(Notify::new()),
            active_calls: Arc::new(AtomicU64::new(0)),
            drained_notify: Arc::new(Notify::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn spec(&self) -> &ComponentSpec {
        &self.spec
    }

    /// The shared bus handle this component borrows (SPEC_FULL.md §9, bus
    /// ownership resolution) — exposed so specializations living outside
    /// this crate (e.g. `conduit-service`'s aligner) can add subscriptions
    /// beyond the one input channel the base itself manages.
    pub fn bus(&self) -> &Arc<dyn BusAdapter> {
        &self.bus
    }

    /// The user logic this base dispatches to, for specializations outside
    /// this crate that need to drive it directly (e.g. the aligner's
    /// background alignment loop).
    pub fn component(&self) -> &Arc<C> {
        &self.component
    }

    /// Whether `stop()` has been called — checked by background worker
    /// loops living outside this crate (sensor/aligner execute loops).
    pub fn stop_requested(&self) -> &Arc<AtomicBool> {
        &self.stop_requested
    }

    /// Notified once per `stop()` call, so a worker loop `select!`s on it
    /// instead of polling `stop_requested()`.
    pub fn stop_notify(&self) -> &Arc<Notify> {
        &self.stop_notify
    }

    /// Idempotent setup: register the input-message and request handlers,
    /// then transition to `Ready`. Subclasses (sensor/actuator) that spawn
    /// their own worker must call this first so output is never produced
    /// before handlers are live.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() as u8 >= Lifecycle::Starting as u8 {
            return Ok(());
        }
        *self.lifecycle.write() = Lifecycle::Starting;

        let message_token = self.register_message_handler().await?;
        let request_token = self.register_request_handler().await?;
        self.subscriptions.lock().push(message_token);
        self.subscriptions.lock().push(request_token);

        *self.lifecycle.write() = Lifecycle::Ready;
        Ok(())
    }

    async fn register_message_handler(self: &Arc<Self>) -> Result<conduit_bus::SubscriptionToken> {
        let this = self.clone();
        self.bus
            .subscribe(
                &self.spec.input_channel(),
                Box::new(move |bytes| {
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.handle_input(bytes).await;
                    });
                }),
            )
            .await
    }

    async fn handle_input(self: &Arc<Self>, bytes: Vec<u8>) {
        let envelope = match frame::decode(&bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(component = %self.spec.name, error = %e, "failed to decode input message");
                return;
            }
        };
        if !self.component.declared_inputs().iter().any(|k| k == &envelope.kind) {
            tracing::warn!(
                component = %self.spec.name,
                kind = %envelope.kind,
                "rejected message kind outside declared inputs"
            );
            return;
        }
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.component.on_message(envelope).await {
            tracing::error!(component = %self.spec.name, error = %e, "on_message failed");
        }
        if self.active_calls.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained_notify.notify_one();
        }
    }

    async fn register_request_handler(self: &Arc<Self>) -> Result<conduit_bus::SubscriptionToken> {
        let this = self.clone();
        self.bus
            .subscribe(
                &self.spec.request_reply_channel(),
                Box::new(move |bytes| {
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.handle_request(bytes).await;
                    });
                }),
            )
            .await
    }

    async fn handle_request(self: &Arc<Self>, bytes: Vec<u8>) {
        let envelope = match frame::decode(&bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(component = %self.spec.name, error = %e, "failed to decode request");
                return;
            }
        };

        match envelope.kind.as_str() {
            conduit_core::message::kind::PING => {
                let reply = Envelope::new(conduit_core::message::kind::PONG, serde_json::json!({}))
                    .stamp_reply(envelope.request_id);
                self.reply(reply).await;
                return;
            }
            conduit_core::message::kind::STOP_REQUEST => {
                // One-way signal: `Connector::stop` publishes this without
                // waiting for a reply (§4.G); trigger shutdown and stop.
                self.stop_requested.store(true, Ordering::SeqCst);
                self.stop_notify.notify_waiters();
                return;
            }
            conduit_core::message::kind::CONNECT_INPUT_REQUEST => {
                let request_id = envelope.request_id;
                let reply = match ControlPayload::from_envelope(&envelope) {
                    Ok(ControlPayload::ConnectInputRequest { channel }) => match self.connect_input(channel).await {
                        Ok(()) => Envelope::new(
                            conduit_core::message::kind::SUCCESS,
                            serde_json::to_value(ControlPayload::Success).unwrap(),
                        ),
                        Err(e) => Envelope::new(
                            conduit_core::message::kind::NOT_STARTED,
                            serde_json::to_value(ControlPayload::NotStarted { reason: e.to_string() }).unwrap(),
                        ),
                    },
                    _ => Envelope::new(
                        conduit_core::message::kind::NOT_STARTED,
                        serde_json::to_value(ControlPayload::NotStarted {
                            reason: "malformed connect_input_request".into(),
                        })
                        .unwrap(),
                    ),
                };
                self.reply(reply.stamp_reply(request_id)).await;
                return;
            }
            _ => {}
        }

        if !envelope.is_request() {
            // A reply arriving on our own request/reply channel (e.g. from
            // a nested request we issued) is not ours to dispatch.
            return;
        }

        self.active_calls.fetch_add(1, Ordering::SeqCst);
        let request_id = envelope.request_id;
        let component_name = self.spec.name.clone();
        let result = self.component.on_request(envelope).await;
        if self.active_calls.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained_notify.notify_one();
        }
        match result {
            Ok(reply) => self.reply(reply.stamp_reply(request_id)).await,
            Err(Error::MessageTypeRejected { kind, .. }) => {
                tracing::warn!(component = %component_name, kind = %kind, "rejected request kind outside declared handling");
            }
            Err(e) => {
                tracing::error!(component = %component_name, error = %e, "on_request failed");
            }
        }
    }

    /// Subscribe `channel` and forward every message on it through the
    /// same validated dispatch path as the component's own input channel
    /// (SPEC_FULL.md §4.G, `Connector::connect`). The extra subscription is
    /// torn down alongside the component's own handlers on `stop()`.
    async fn connect_input(self: &Arc<Self>, channel: String) -> Result<()> {
        let this = self.clone();
        let token = self
            .bus
            .subscribe(
                &channel,
                Box::new(move |bytes| {
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.handle_input(bytes).await;
                    });
                }),
            )
            .await?;
        self.subscriptions.lock().push(token);
        Ok(())
    }

    async fn reply(&self, envelope: Envelope) {
        if let Ok(bytes) = frame::encode(&envelope) {
            if let Err(e) = self.bus.publish(&self.spec.request_reply_channel(), bytes).await {
                tracing::error!(component = %self.spec.name, error = %e, "failed to publish reply");
            }
        }
    }

    /// Attach `previous_component_name` and publish on the output channel.
    pub async fn publish(&self, mut message: Envelope) -> Result<()> {
        message.previous_component_name = self.spec.name.clone();
        let bytes = frame::encode(&message)?;
        self.bus.publish(&self.spec.output_channel(), bytes).await?;
        Ok(())
    }

    /// Called by this component's worker (if any) when it has fully exited
    /// in response to the stop signal. A component with no background
    /// worker (plain request/message handling only) should call this
    /// immediately once it observes the stop signal, since there is no
    /// loop to drain.
    pub fn confirm_stopped(&self) {
        self.stopped_flag.store(true, Ordering::SeqCst);
        self.stopped_notify.notify_waiters();
    }

    /// Spawns the trivial confirmation task used by components with no
    /// background worker: wait for the stop signal, confirm immediately.
    /// Sensor/Actuator specializations spawn their own worker instead of
    /// calling this.
    pub fn spawn_trivial_worker(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.stop_notify.notified().await;
            this.confirm_stopped();
        });
    }

    /// Set the stop-signal, wait up to `stop_timeout` for the worker to
    /// confirm `Stopped`, then wait up to `stop_timeout` again for active
    /// calls to drain before invoking `cleanup()`. If the worker does not
    /// confirm in time, cleanup is skipped entirely and a warning logged —
    /// this is deliberate (SPEC_FULL.md §4.D), not an oversight.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        *self.lifecycle.write() = Lifecycle::Stopping;
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();

        if !self.wait_stopped().await {
            tracing::warn!(
                component = %self.spec.name,
                "worker did not confirm Stopped within stop_timeout; skipping cleanup"
            );
            return Ok(());
        }
        *self.lifecycle.write() = Lifecycle::Stopped;

        self.wait_drained().await;

        for token in self.subscriptions.lock().drain(..).collect::<Vec<_>>() {
            let _ = self.bus.unsubscribe(token).await;
        }

        if let Err(e) = self.component.cleanup().await {
            tracing::error!(component = %self.spec.name, error = %e, "cleanup failed");
        }
        *self.lifecycle.write() = Lifecycle::Cleaned;
        Ok(())
    }

    async fn wait_stopped(&self) -> bool {
        if self.stopped_flag.load(Ordering::SeqCst) {
            return true;
        }
        let deadline = tokio::time::Instant::now() + self.spec.stop_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.stopped_flag.load(Ordering::SeqCst);
            }
            let wait = self.stopped_notify.notified();
            if tokio::time::timeout(remaining, wait).await.is_err() {
                return self.stopped_flag.load(Ordering::SeqCst);
            }
            if self.stopped_flag.load(Ordering::SeqCst) {
                return true;
            }
        }
    }

    async fn wait_drained(&self) {
        let deadline = tokio::time::Instant::now() + self.spec.stop_timeout;
        loop {
            if self.active_calls.load(Ordering::SeqCst) == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(
                    component = %self.spec.name,
                    "active calls did not drain within stop_timeout; proceeding to cleanup anyway"
                );
                return;
            }
            let wait = self.drained_notify.notified();
            if tokio::time::timeout(remaining, wait).await.is_err() {
                tracing::warn!(
                    component = %self.spec.name,
                    "active calls did not drain within stop_timeout; proceeding to cleanup anyway"
                );
                return;
            }
        }
    }
}
