//! Singleton holding the process's shared bus handle, shutdown event, and
//! connector registry (SPEC_FULL.md §4.H).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use conduit_bus::BusAdapter;
use conduit_core::{ConnectorHandle, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;

static INSTANCE: OnceLock<Arc<ApplicationContext>> = OnceLock::new();

/// The one bus handle, shutdown event, and connector registry a process
/// shares across every component, service, manager, and connector it runs.
/// Construct with [`ApplicationContext::init`]; every later caller fetches
/// the same instance with [`ApplicationContext::global`].
pub struct ApplicationContext {
    bus: Arc<dyn BusAdapter>,
    shutdown: Arc<Notify>,
    connectors: Mutex<Vec<Weak<dyn ConnectorHandle>>>,
    shutting_down: AtomicBool,
}

impl ApplicationContext {
    fn new(bus: Arc<dyn BusAdapter>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            shutdown: Arc::new(Notify::new()),
            connectors: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Build the singleton and start the signal-driven shutdown listener.
    /// Calling this more than once returns the first instance built; later
    /// `bus` arguments are discarded.
    pub fn init(bus: Arc<dyn BusAdapter>) -> Arc<Self> {
        INSTANCE
            .get_or_init(|| {
                let ctx = Self::new(bus);
                ctx.clone().spawn_signal_listener();
                ctx
            })
            .clone()
    }

    /// Fetch the process-wide instance. Panics if [`Self::init`] has not
    /// run yet — every entry point (`conduit-cli`, tests that need one)
    /// must call `init` first.
    pub fn global() -> Arc<Self> {
        INSTANCE
            .get()
            .expect("ApplicationContext::init must be called before ApplicationContext::global")
            .clone()
    }

    /// Whether the singleton has been constructed in this process, without
    /// panicking if it hasn't.
    pub fn is_initialized() -> bool {
        INSTANCE.get().is_some()
    }

    pub fn bus(&self) -> Arc<dyn BusAdapter> {
        self.bus.clone()
    }

    /// A `Notify` that fires once graceful shutdown has been triggered —
    /// background loops `select!` on it the same way a component's worker
    /// loop selects on its own stop-notify.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Register a connector so `shutdown()` stops it too. Stored as a
    /// `Weak` reference: a connector the caller has already dropped is
    /// simply skipped rather than kept alive past its owner.
    pub fn register_connector(&self, handle: Weak<dyn ConnectorHandle>) {
        self.connectors.lock().push(handle);
    }

    fn spawn_signal_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            if let Err(e) = self.shutdown().await {
                tracing::error!(error = %e, "error during signal-triggered shutdown");
            }
        });
    }

    /// Trigger graceful shutdown: notify every waiter, best-effort stop
    /// every live connector concurrently, then close the bus. Idempotent —
    /// a second call (including one racing the first from within a panic
    /// unwind) is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_waiters();

        let live: Vec<Arc<dyn ConnectorHandle>> = {
            let mut connectors = self.connectors.lock();
            connectors.retain(|w| w.strong_count() > 0);
            connectors.iter().filter_map(Weak::upgrade).collect()
        };
        futures::future::join_all(live.iter().map(|c| async move {
            if let Err(e) = c.stop().await {
                tracing::error!(error = %e, "error stopping connector during shutdown");
            }
        }))
        .await;

        self.bus.close().await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, only watching ctrl-c");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
