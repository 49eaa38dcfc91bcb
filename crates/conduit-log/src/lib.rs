pub mod layer;
pub mod subscriber;

pub use layer::{BusLogLayer, FRAMEWORK_TARGET, FRAMEWORK_VERBOSE_TARGET};
pub use subscriber::{component_span, LogSubscriber};
