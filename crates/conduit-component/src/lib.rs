pub mod actuator;
pub mod base;
pub mod component;
pub mod lifecycle;
pub mod runtime;
pub mod sensor;

pub use actuator::ActuatorBase;
pub use base::{ComponentBase, ComponentSpec};
pub use component::{ActuatorComponent, Component, SensorComponent};
pub use lifecycle::Lifecycle;
pub use runtime::{Handle, RunningComponent};
pub use sensor::SensorBase;
