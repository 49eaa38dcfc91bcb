use thiserror::Error;

/// Error taxonomy shared by every crate in the runtime.
///
/// Variants map 1:1 onto the error kinds a caller needs to branch on, not
/// onto implementation detail — see each crate's own error conversions for
/// how lower-level failures (bus, serde, io) get folded in here.
#[derive(Error, Debug)]
pub enum Error {
    // ── Connector / manager request errors ─────────────────────
    #[error("no manager replied to Ping at {address} within {timeout_ms}ms")]
    DeviceUnreachable { address: String, timeout_ms: u64 },

    #[error("component failed to start: {reason}")]
    ComponentNotStarted { reason: String },

    #[error("component '{component_id}' is already reserved by another client")]
    ReservationConflict { component_id: String },

    #[error("no reply received within the caller's deadline")]
    RequestTimeout,

    // ── Envelope / message errors ───────────────────────────────
    #[error("envelope kind '{kind}' has no registered decoder")]
    UnknownMessageKind { kind: String },

    #[error("component '{component}' received message kind '{kind}' outside its declared inputs")]
    MessageTypeRejected { kind: String, component: String },

    // ── Service alignment (internal, never crosses an API boundary) ────
    #[error("alignment pending: not every declared input has a usable bucket yet")]
    AlignmentPending,

    // ── Bus / configuration ──────────────────────────────────────
    #[error("bus error: {0}")]
    Bus(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    // ── Generic wrappers ─────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
