/// Filter-config loader with validation and hot-reload support.
///
/// Reads the JSON file named by the `TOOL_FILTER_CONFIG` environment
/// variable, validates on load, watches for file changes via `notify`, and
/// broadcasts config updates via `tokio::sync::watch`.
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::FilterConfig;
use crate::errors::GateError;

/// Environment variable pointing at the filter configuration file.
pub const TOOL_FILTER_CONFIG_ENV: &str = "TOOL_FILTER_CONFIG";

/// Loads, validates, and watches the filter configuration file.
pub struct FilterConfigLoader {
    /// Path of the watched config file.
    config_path: PathBuf,
    /// Watch sender for broadcasting config changes.
    tx: watch::Sender<FilterConfig>,
    /// File watcher handle (kept alive to maintain the watch).
    _watcher: Option<RecommendedWatcher>,
}

impl FilterConfigLoader {
    /// Load the filter config from the `TOOL_FILTER_CONFIG` env var.
    ///
    /// An unset variable yields the default configuration with no file
    /// watching; a set variable pointing at a missing or invalid file is a
    /// hard error.
    pub fn from_env() -> Result<(Self, watch::Receiver<FilterConfig>), GateError> {
        match std::env::var(TOOL_FILTER_CONFIG_ENV) {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => {
                let (tx, rx) = watch::channel(FilterConfig::default());
                Ok((
                    Self {
                        config_path: PathBuf::new(),
                        tx,
                        _watcher: None,
                    },
                    rx,
                ))
            }
        }
    }

    /// Load the filter config from a file, validate, and return the loader
    /// along with a `watch::Receiver` for subscribing to changes.
    pub fn load(config_path: &Path) -> Result<(Self, watch::Receiver<FilterConfig>), GateError> {
        let config = Self::load_file(config_path)?;
        Self::validate(&config)?;

        let (tx, rx) = watch::channel(config);

        Ok((
            Self {
                config_path: config_path.to_path_buf(),
                tx,
                _watcher: None,
            },
            rx,
        ))
    }

    /// Start watching the config file for changes.
    ///
    /// File changes trigger a reload. If the new config is valid, it's
    /// broadcast via the watch channel. Invalid configs are logged but
    /// don't replace the current valid config.
    pub fn watch(&mut self) -> Result<(), GateError> {
        if self.config_path.as_os_str().is_empty() {
            return Err(GateError::Config(
                "no config file to watch (loaded from defaults)".to_string(),
            ));
        }
        let config_path = self.config_path.clone();
        let tx = self.tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        match Self::load_file(&config_path) {
                            Ok(config) => match Self::validate(&config) {
                                Ok(()) => {
                                    let _ = tx.send(config);
                                    tracing::info!("filter config reloaded successfully");
                                }
                                Err(e) => {
                                    tracing::warn!("filter config validation failed after file change, keeping previous config: {e}");
                                }
                            },
                            Err(e) => {
                                tracing::warn!("filter config load failed after file change, keeping previous config: {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("file watcher error: {e}");
                }
            }
        })
        .map_err(|e| GateError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(|e| GateError::Config(format!("failed to watch config file: {e}")))?;

        self._watcher = Some(watcher);
        tracing::info!(path = %self.config_path.display(), "started watching filter config");
        Ok(())
    }

    /// Read and parse one config file.
    fn load_file(path: &Path) -> Result<FilterConfig, GateError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GateError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| GateError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Validate a parsed config.
    fn validate(config: &FilterConfig) -> Result<(), GateError> {
        if config.auto_disable_ttl_ms == 0 {
            return Err(GateError::Config(
                "autoDisableTtlMs must be positive".to_string(),
            ));
        }
        for pattern in config
            .auto_enable_allowlist
            .iter()
            .chain(config.auto_enable_blocklist.iter())
        {
            if pattern.is_empty() {
                return Err(GateError::Config(
                    "allow/block patterns must be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
