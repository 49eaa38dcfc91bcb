//! Actuator specialization: driven entirely by requests, no background
//! sampling loop (SPEC_FULL.md §4.D).

use std::sync::Arc;

use conduit_bus::BusAdapter;
use conduit_core::{channel, Error, Envelope, Result};

use crate::base::{ComponentBase, ComponentSpec};
use crate::component::{ActuatorComponent, Component};
use crate::lifecycle::Lifecycle;
use crate::runtime::RunningComponent;

/// Like [`crate::sensor::SensorBase`] but without an execute loop:
/// `on_request` dispatches straight into [`ActuatorComponent::execute`].
pub struct ActuatorBase<A: ActuatorComponent + 'static> {
    base: Arc<ComponentBase<Adapter<A>>>,
}

/// Bridges [`ActuatorComponent::execute`] onto [`Component::on_request`] so
/// an actuator reuses the same base dispatch path as any other component.
struct Adapter<A: ActuatorComponent> {
    inner: A,
}

#[async_trait::async_trait]
impl<A: ActuatorComponent> Component for Adapter<A> {
    fn declared_inputs(&self) -> &[String] {
        self.inner.declared_inputs()
    }

    fn output_kind(&self) -> &str {
        self.inner.output_kind()
    }

    async fn on_message(&self, message: Envelope) -> Result<()> {
        self.inner.on_message(message).await
    }

    async fn on_request(&self, request: Envelope) -> Result<Envelope> {
        self.inner.execute(request).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner.cleanup().await
    }
}

impl<A: ActuatorComponent + 'static> ActuatorBase<A> {
    pub fn new(bus: Arc<dyn BusAdapter>, spec: ComponentSpec, component: A) -> Self {
        Self {
            base: ComponentBase::new(bus, spec, Adapter { inner: component }),
        }
    }

    pub fn base(&self) -> &Arc<ComponentBase<Adapter<A>>> {
        &self.base
    }

    pub fn state(&self) -> Lifecycle {
        self.base.state()
    }

    fn reservation_key(&self) -> String {
        channel::reservation_key(&self.base.spec().component_id())
    }

    /// Acquire the exclusive-hardware reservation, then register handlers
    /// and transition to `Ready`. There is no background loop to spawn:
    /// the base's trivial stop-confirmation is sufficient.
    pub async fn start(&self) -> Result<()> {
        let key = self.reservation_key();
        let acquired = self.base.bus.set_if_absent(&key, &self.base.spec().client_id).await?;
        if !acquired {
            return Err(Error::ReservationConflict {
                component_id: self.base.spec().component_id(),
            });
        }

        self.base.spawn_trivial_worker();
        self.base.start().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.base.stop().await?;
        self.base.bus.delete(&self.reservation_key()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A: ActuatorComponent + 'static> RunningComponent for ActuatorBase<A> {
    async fn start(&self) -> Result<()> {
        ActuatorBase::start(self).await
    }

    async fn stop(&self) -> Result<()> {
        ActuatorBase::stop(self).await
    }
}
