use std::sync::Arc;

use conduit_bus::BusAdapter;
use conduit_core::{channel::LOG_CHANNEL, frame, ControlPayload};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Framework-internal sub-debug targets, below `DEBUG` in spirit — `tracing`
/// has no numeric sub-debug tier, so these are plain targets an `EnvFilter`
/// directive can select independently (e.g. `conduit::framework=trace`).
pub const FRAMEWORK_TARGET: &str = "conduit::framework";
pub const FRAMEWORK_VERBOSE_TARGET: &str = "conduit::framework::verbose";

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// A `tracing_subscriber::Layer` that publishes every event it sees, as a
/// `log_message` envelope, onto [`LOG_CHANNEL`] — the bus-channel half of
/// the dual-sink logging fabric described in SPEC_FULL.md §4.C. Install
/// alongside a normal `fmt` layer for the stderr half.
pub struct BusLogLayer {
    sender: mpsc::UnboundedSender<String>,
}

impl BusLogLayer {
    pub fn new(bus: Arc<dyn BusAdapter>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = receiver.recv().await {
                let Ok(envelope) = (ControlPayload::LogMessage { text }).into_envelope() else {
                    continue;
                };
                if let Ok(bytes) = frame::encode(&envelope) {
                    if let Err(e) = bus.publish(LOG_CHANNEL, bytes).await {
                        tracing::trace!(error = %e, "failed to publish log record to the bus");
                    }
                }
            }
        });
        Self { sender }
    }
}

impl<S> Layer<S> for BusLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let formatted = format!(
            "[{} {}]-----{}: {}",
            metadata.target(),
            metadata.level(),
            metadata.level(),
            visitor.message
        );
        // An unbounded send only fails if the receiving task has already
        // exited (process shutting down); dropping the record is correct.
        let _ = self.sender.send(formatted);
    }
}
