use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use conduit_app::ApplicationContext;
use conduit_bus::{BusAdapter, RedisBus};
use conduit_connector::{request_reply, RequestOutcome};
use conduit_core::{channel, BusConfig, ControlPayload, Result};
use conduit_log::{BusLogLayer, LogSubscriber};
use conduit_manager::{ComponentFactory, ComponentManager};

use crate::echo::Echo;

/// Distributed component runtime command-line entry point.
#[derive(Parser)]
#[command(name = "conduit", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to conduit.toml (defaults to `$CONDUIT_CONFIG` or `~/.conduit/conduit.toml`)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a component manager for one device and serve until interrupted
    RunManager {
        /// The IP address this manager's channel is named after
        #[arg(long)]
        device_ip: String,
    },
    /// Check whether a manager is reachable on a device
    Ping {
        /// The device IP to ping
        #[arg(long)]
        device_ip: String,
        /// Milliseconds to wait for a reply before reporting unreachable
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// Ping a set of named components and report which ones answer
    List {
        /// The device IP the components run on
        #[arg(long)]
        device_ip: String,
        /// Comma-separated component names to probe
        #[arg(long, value_delimiter = ',')]
        components: Vec<String>,
        /// Milliseconds to wait for each reply
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let log_level = self.log_level.clone().unwrap_or_else(|| "info".to_string());
        let config = BusConfig::load(self.config.as_deref())?;
        for warning in config.validate() {
            eprintln!("warning: {warning}");
        }

        match self.command {
            Commands::RunManager { device_ip } => Self::cmd_run_manager(config, device_ip, log_level).await,
            Commands::Ping { device_ip, timeout_ms } => {
                Self::init_stderr_logging(&log_level);
                Self::cmd_ping(config, device_ip, timeout_ms).await
            }
            Commands::List {
                device_ip,
                components,
                timeout_ms,
            } => {
                Self::init_stderr_logging(&log_level);
                Self::cmd_list(config, device_ip, components, timeout_ms).await
            }
        }
    }

    /// Stderr-only subscriber, for subcommands that never own an
    /// Application Context and so have no log channel to dual-publish to.
    fn init_stderr_logging(log_level: &str) {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
            )
            .with_target(false)
            .init();
    }

    async fn cmd_run_manager(config: BusConfig, device_ip: String, log_level: String) -> Result<()> {
        let bus: Arc<dyn BusAdapter> = RedisBus::connect(&config).await?;
        let ctx = ApplicationContext::init(bus);

        // Dual-sink logging fabric (SPEC_FULL.md §4.C): stderr via the usual
        // `fmt` layer, plus every event republished on the bus log channel
        // for a remote tail.
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(BusLogLayer::new(ctx.bus()))
            .init();

        LogSubscriber::attach(ctx.bus()).await?;

        let manager = ComponentManager::new(ctx.bus(), device_ip.clone());
        manager.register("Echo", ComponentFactory::plain(|_| Ok(Echo)));
        manager.serve().await?;

        println!("manager listening on {device_ip}");

        let manager_stop = manager.stop_signal();
        let app_shutdown = ctx.shutdown_signal();
        tokio::select! {
            _ = manager_stop.notified() => {}
            _ = app_shutdown.notified() => {}
        }

        manager.shutdown().await
    }

    async fn cmd_ping(config: BusConfig, device_ip: String, timeout_ms: u64) -> Result<()> {
        let bus: Arc<dyn BusAdapter> = RedisBus::connect(&config).await?;
        let envelope = ControlPayload::Ping.into_envelope()?;
        let outcome = request_reply(
            &bus,
            &channel::manager_channel(&device_ip),
            envelope,
            Duration::from_millis(timeout_ms),
        )
        .await;

        match outcome {
            RequestOutcome::Reply(_) => println!("{device_ip}: reachable"),
            RequestOutcome::Timeout => println!("{device_ip}: unreachable (no reply within {timeout_ms}ms)"),
        }
        bus.close().await
    }

    async fn cmd_list(config: BusConfig, device_ip: String, components: Vec<String>, timeout_ms: u64) -> Result<()> {
        let bus: Arc<dyn BusAdapter> = RedisBus::connect(&config).await?;
        for name in components {
            let reply_channel = channel::request_reply_channel(&name, &device_ip);
            let envelope = ControlPayload::Ping.into_envelope()?;
            let outcome = request_reply(&bus, &reply_channel, envelope, Duration::from_millis(timeout_ms)).await;
            match outcome {
                RequestOutcome::Reply(_) => println!("{name}@{device_ip}: running"),
                RequestOutcome::Timeout => println!("{name}@{device_ip}: not running"),
            }
        }
        bus.close().await
    }
}
