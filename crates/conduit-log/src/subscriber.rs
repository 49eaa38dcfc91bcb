use std::sync::Arc;

use conduit_bus::BusAdapter;
use conduit_core::channel::LOG_CHANNEL;
use conduit_core::{frame, ControlPayload};

/// Builds the span every component's log records should be nested under, so
/// `(component name, device IP[, client id])` are attached as structured
/// fields without manual string formatting at every call site.
pub fn component_span(name: &str, device_ip: &str, client_id: Option<&str>) -> tracing::Span {
    match client_id {
        Some(client_id) => tracing::info_span!(
            "component",
            component.name = name,
            component.device_ip = device_ip,
            component.client_id = client_id,
        ),
        None => tracing::info_span!(
            "component",
            component.name = name,
            component.device_ip = device_ip,
        ),
    }
}

/// Opt-in, one-per-process subscriber that prints records received on
/// [`LOG_CHANNEL`] to its own terminal, giving cross-device visibility —
/// the runtime's equivalent of a remote tail. Unlike the upstream log
/// subscriber this is compatible with, it never raises on message content;
/// see SPEC_FULL.md's REDESIGN FLAGS for why that behavior was dropped.
pub struct LogSubscriber;

impl LogSubscriber {
    /// Subscribes to the log channel for the lifetime of `bus`. Intended to
    /// be started once per process by whatever owns the Application
    /// Context.
    pub async fn attach(bus: Arc<dyn BusAdapter>) -> conduit_core::Result<()> {
        bus.subscribe(
            LOG_CHANNEL,
            Box::new(|payload| {
                let Ok(envelope) = frame::decode(&payload) else {
                    return;
                };
                if let Ok(ControlPayload::LogMessage { text }) = ControlPayload::from_envelope(&envelope) {
                    println!("{text}");
                }
            }),
        )
        .await?;
        Ok(())
    }
}
