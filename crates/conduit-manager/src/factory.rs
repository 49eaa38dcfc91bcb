//! Factory registry glue: the manager only knows component names as
//! strings (the class-name-dispatch design note in SPEC_FULL.md §9), so
//! every registered kind is boxed behind a uniform build function that
//! returns a type-erased [`RunningComponent`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_bus::BusAdapter;
use conduit_component::{
    ActuatorBase, ActuatorComponent, Component, ComponentBase, ComponentSpec, Handle, RunningComponent, SensorBase,
    SensorComponent,
};
use conduit_core::Result;
use conduit_service::{Aligner, AlignerHandle, AlignerLogic};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type FactoryFn = dyn Fn(Arc<dyn BusAdapter>, ComponentSpec, serde_json::Value) -> BoxFuture<'static, Result<Arc<dyn RunningComponent>>>
    + Send
    + Sync;

/// A registered component kind: how to build+start an instance, and
/// whether it claims exclusive hardware (sensor/actuator) or can be shared
/// across clients (plain components, services) — see
/// [`crate::manager::ComponentManager::start_component`] for how this flag
/// resolves the idempotent-start vs. reservation-conflict distinction.
#[derive(Clone)]
pub struct ComponentFactory {
    build: Arc<FactoryFn>,
    pub exclusive: bool,
}

impl ComponentFactory {
    pub fn new(
        exclusive: bool,
        build: impl Fn(Arc<dyn BusAdapter>, ComponentSpec, serde_json::Value) -> BoxFuture<'static, Result<Arc<dyn RunningComponent>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            build: Arc::new(build),
            exclusive,
        }
    }

    pub async fn build(
        &self,
        bus: Arc<dyn BusAdapter>,
        spec: ComponentSpec,
        config: serde_json::Value,
    ) -> Result<Arc<dyn RunningComponent>> {
        (self.build)(bus, spec, config).await
    }

    /// A plain request/reply component with no hardware reservation —
    /// shared by every client that starts it (e.g. the Echo scenario in
    /// SPEC_FULL.md §8).
    pub fn plain<C, F>(build: F) -> Self
    where
        C: Component + 'static,
        F: Fn(serde_json::Value) -> Result<C> + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        Self::new(false, move |bus, spec, config| {
            let build = build.clone();
            Box::pin(async move {
                let component = build(config)?;
                let handle = Arc::new(Handle::new(ComponentBase::new(bus, spec, component)));
                handle.start().await?;
                Ok(handle as Arc<dyn RunningComponent>)
            })
        })
    }

    /// A sensor: acquires the exclusive-hardware reservation on start
    /// (SPEC_FULL.md §4.D).
    pub fn sensor<S, F>(build: F) -> Self
    where
        S: SensorComponent + 'static,
        F: Fn(serde_json::Value) -> Result<S> + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        Self::new(true, move |bus, spec, config| {
            let build = build.clone();
            Box::pin(async move {
                let component = build(config)?;
                let sensor = Arc::new(SensorBase::new(bus, spec, component));
                sensor.start().await?;
                Ok(sensor as Arc<dyn RunningComponent>)
            })
        })
    }

    /// An actuator: acquires the same kind of exclusive reservation as a
    /// sensor but is driven by requests rather than a sampling loop.
    pub fn actuator<A, F>(build: F) -> Self
    where
        A: ActuatorComponent + 'static,
        F: Fn(serde_json::Value) -> Result<A> + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        Self::new(true, move |bus, spec, config| {
            let build = build.clone();
            Box::pin(async move {
                let component = build(config)?;
                let actuator = Arc::new(ActuatorBase::new(bus, spec, component));
                actuator.start().await?;
                Ok(actuator as Arc<dyn RunningComponent>)
            })
        })
    }

    /// A multi-input aligning service (SPEC_FULL.md §4.E). Services hold no
    /// hardware reservation — like plain components, they are shared.
    pub fn service<A, F>(build: F) -> Self
    where
        A: AlignerLogic + 'static,
        F: Fn(serde_json::Value) -> Result<A> + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        Self::new(false, move |bus, spec, config| {
            let build = build.clone();
            Box::pin(async move {
                let logic = build(config)?;
                let aligner = Arc::new(Aligner::new(bus, spec, logic));
                let handle = Arc::new(AlignerHandle::new(aligner));
                handle.start().await?;
                Ok(handle as Arc<dyn RunningComponent>)
            })
        })
    }
}
