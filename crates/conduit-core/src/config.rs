//! Bus connection configuration: env-var precedence, optional `conduit.toml`,
//! and hot-reload watching for long-running manager processes.
//!
//! Precedence (highest wins): explicit override passed to [`BusConfig::load`]
//! > environment variables > `conduit.toml` > built-in default.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const DEFAULT_DB_IP: &str = "127.0.0.1";
const DEFAULT_DB_PASS: &str = "changemeplease";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    #[serde(default = "default_db_ip")]
    pub db_ip: String,
    #[serde(default = "default_db_pass")]
    pub db_pass: String,
    /// Override for the bundled TLS CA bundle path; falls back to the
    /// embedded certificate when unset.
    pub tls_ca_path: Option<PathBuf>,
}

fn default_db_ip() -> String {
    DEFAULT_DB_IP.to_string()
}

fn default_db_pass() -> String {
    DEFAULT_DB_PASS.to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            db_ip: default_db_ip(),
            db_pass: default_db_pass(),
            tls_ca_path: None,
        }
    }
}

impl BusConfig {
    /// Resolve the config file path: explicit override, `CONDUIT_CONFIG`
    /// env var, or `~/.conduit/conduit.toml`.
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = explicit {
            return Some(p.to_path_buf());
        }
        if let Ok(p) = std::env::var("CONDUIT_CONFIG") {
            return Some(PathBuf::from(p));
        }
        dirs::home_dir().map(|h| h.join(".conduit").join("conduit.toml"))
    }

    /// Load from (in increasing precedence) the built-in default, an
    /// optional TOML file, then environment variables.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_path(explicit_path) {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)?;
                toml::from_str(&text)?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DB_IP") {
            self.db_ip = v;
        }
        if let Ok(v) = std::env::var("DB_PASS") {
            self.db_pass = v;
        }
        if let Ok(v) = std::env::var("CONDUIT_TLS_CA") {
            self.tls_ca_path = Some(PathBuf::from(v));
        }
    }

    /// Non-fatal sanity checks; returns human-readable warnings rather than
    /// failing hard, so a manager can start with a slightly odd config and
    /// let an operator fix it without a crash loop.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.db_pass == DEFAULT_DB_PASS {
            warnings.push("DB_PASS is set to the well-known default; do not use in production".into());
        }
        if let Some(path) = &self.tls_ca_path {
            if !path.exists() {
                warnings.push(format!("CONDUIT_TLS_CA points at a missing file: {}", path.display()));
            }
        }
        warnings
    }
}

/// Wraps a [`BusConfig`] behind a lock and an optional filesystem watcher so
/// a manager process can pick up an edited `conduit.toml` without a
/// restart.
pub struct ConfigWatcher {
    config: Arc<RwLock<BusConfig>>,
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigWatcher {
    pub fn new(explicit_path: Option<&Path>) -> Result<Self> {
        let config = Arc::new(RwLock::new(BusConfig::load(explicit_path)?));
        let watch_path = BusConfig::resolve_path(explicit_path);

        let watcher = watch_path.and_then(|path| {
            if !path.exists() {
                return None;
            }
            let watched = config.clone();
            let watch_path = path.clone();
            let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                if let Ok(text) = std::fs::read_to_string(&watch_path) {
                    if let Ok(mut reloaded) = toml::from_str::<BusConfig>(&text) {
                        reloaded.apply_env_overrides();
                        *watched.write() = reloaded;
                    }
                }
            })
            .ok()?;
            watcher.watch(&path, RecursiveMode::NonRecursive).ok()?;
            Some(watcher)
        });

        Ok(Self {
            config,
            _watcher: watcher,
        })
    }

    pub fn current(&self) -> BusConfig {
        self.config.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = BusConfig::default();
        assert_eq!(config.db_ip, "127.0.0.1");
        assert_eq!(config.db_pass, "changemeplease");
    }

    #[test]
    fn default_password_triggers_a_warning() {
        let config = BusConfig::default();
        assert!(config.validate().iter().any(|w| w.contains("DB_PASS")));
    }
}
