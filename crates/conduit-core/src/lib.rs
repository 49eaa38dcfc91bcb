pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod handle;
pub mod message;

pub use config::{BusConfig, ConfigWatcher};
pub use error::{Error, Result};
pub use handle::ConnectorHandle;
pub use message::{kind, ControlPayload, Envelope, KindRegistry, IGNORE_REQUEST_ID, UNSET_REQUEST_ID};
