//! The user-facing hooks every concrete component implements. `Component`
//! covers the common request/message dispatch every component has;
//! `SensorComponent`/`ActuatorComponent` add the two specializations from
//! SPEC_FULL.md §4.D. None of these traits touch the bus directly — that is
//! [`crate::base::ComponentBase`]'s job.

use async_trait::async_trait;
use conduit_core::{Envelope, Error, Result};

/// Logic a concrete component plugs into [`crate::base::ComponentBase`].
/// Implementors declare the input kinds they accept and react to messages
/// and requests; the base handles channel derivation, lifecycle, and
/// dispatch filtering.
#[async_trait]
pub trait Component: Send + Sync {
    /// Kind tags this component accepts on its input channel. Messages of
    /// any other kind are dropped by the base with a warning before this
    /// trait ever sees them.
    fn declared_inputs(&self) -> &[String];

    /// The kind tag this component's own output carries. Advisory — used
    /// for documentation and by callers that want to validate a pipeline
    /// before wiring it up.
    fn output_kind(&self) -> &str;

    /// Handle one message already validated against [`Self::declared_inputs`].
    async fn on_message(&self, message: Envelope) -> Result<()> {
        let _ = message;
        Ok(())
    }

    /// Handle a request that was not one of the framework's reserved
    /// control kinds (ping, stop). Returned envelope is stamped with the
    /// request's id by the base before publication — never stamp it here.
    async fn on_request(&self, request: Envelope) -> Result<Envelope> {
        Err(Error::MessageTypeRejected {
            kind: request.kind,
            component: String::new(),
        })
    }

    /// Release any resources (hardware handles, session tokens) held by
    /// this component. Must be safe to call more than once: the base only
    /// calls it once per `Stop()`, but a component's own `Drop` or a retry
    /// path may call it again.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// A component whose output is produced by repeatedly sampling hardware or
/// an external feed rather than reacting to requests (SPEC_FULL.md §4.D,
/// sensor specialization).
#[async_trait]
pub trait SensorComponent: Component {
    /// Produce the next output, or `None` if nothing is ready yet this
    /// iteration (e.g. no new camera frame). Timestamping with broker time
    /// and publication is handled by [`crate::sensor::SensorBase`] — do not
    /// stamp or publish here.
    async fn execute(&self) -> Result<Option<Envelope>>;
}

/// A component driven entirely by requests rather than a sampling loop
/// (SPEC_FULL.md §4.D, actuator specialization).
#[async_trait]
pub trait ActuatorComponent: Component {
    async fn execute(&self, request: Envelope) -> Result<Envelope>;
}
