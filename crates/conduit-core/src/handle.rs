//! The narrow seam between `conduit-app` and `conduit-connector` so the two
//! crates don't need to depend on each other directly (SPEC_FULL.md §4.H):
//! the Application Context holds every live connector as a
//! `Weak<dyn ConnectorHandle>` and drives `stop()` on each during graceful
//! shutdown without knowing the concrete `Connector<C>` type it is talking
//! to.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait ConnectorHandle: Send + Sync {
    /// Best-effort stop: publish the connector's shutdown signal to its
    /// remote component and release any bus handle the connector itself
    /// owns. Must be safe to call more than once.
    async fn stop(&self) -> Result<()>;
}
