//! Type-erased handle a [`crate::base::ComponentBase`] specialization is
//! wrapped in once it is handed to something that must hold many different
//! kinds of component uniformly — namely the manager (SPEC_FULL.md §4.F),
//! which does not know at compile time whether a registered factory builds
//! a plain request/reply component, a [`crate::sensor::SensorBase`], or a
//! [`crate::actuator::ActuatorBase`].

use async_trait::async_trait;
use conduit_core::Result;

use crate::base::ComponentBase;
use crate::component::Component;

/// The uniform surface the manager drives: start (with handlers registered
/// and any reservation acquired) and stop (tear down, release reservation
/// if any). Every concrete specialization in this crate — and the aligner
/// in `conduit-service` — implements this.
#[async_trait]
pub trait RunningComponent: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Wraps a bare [`ComponentBase`] (no sensor/actuator reservation) so it
/// satisfies [`RunningComponent`] — the manager's entry point for plain
/// request/reply components like the Echo scenario in SPEC_FULL.md §8.
pub struct Handle<C: Component + 'static> {
    base: std::sync::Arc<ComponentBase<C>>,
}

impl<C: Component + 'static> Handle<C> {
    pub fn new(base: std::sync::Arc<ComponentBase<C>>) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &std::sync::Arc<ComponentBase<C>> {
        &self.base
    }
}

#[async_trait]
impl<C: Component + 'static> RunningComponent for Handle<C> {
    async fn start(&self) -> Result<()> {
        self.base.spawn_trivial_worker();
        self.base.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.base.stop().await
    }
}
