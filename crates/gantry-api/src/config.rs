//! Engine configuration and initialization parameters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BackendError, Result};

/// Default byte threshold at or above which transfers are striped
/// across rails.
pub const DEFAULT_STRIPING_THRESHOLD: usize = 1024 * 1024;

/// Default idle sleep for the data-rail progress thread.
pub const DEFAULT_PROGRESS_DELAY_US: u64 = 100;

/// Default bound on a blocking `connect`.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// How completion errors affect connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrHandlingMode {
    /// Log and release the request only.
    None,
    /// Additionally mark the owning connection `Failed` on
    /// endpoint-fatal errors.
    Peer,
}

/// Tunables for a fabric engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Transfers of at least this many bytes are striped across every
    /// selected rail; smaller ones round-robin onto a single rail.
    pub striping_threshold: usize,
    /// Sub-engine count for the multi-instance engine.
    pub num_workers: usize,
    /// Spawn the data-rail progress thread.
    pub enable_progress_thread: bool,
    /// Idle sleep of the progress thread, in microseconds.
    pub progress_thread_delay_us: u64,
    /// Restrict the engine to the listed NICs. `None` uses all.
    pub devices: Option<Vec<String>>,
    /// Completion-error handling policy.
    pub err_handling_mode: ErrHandlingMode,
    /// Upper bound on a blocking `connect`, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Record telemetry events in the engine.
    pub enable_telemetry: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            striping_threshold: DEFAULT_STRIPING_THRESHOLD,
            num_workers: 1,
            enable_progress_thread: false,
            progress_thread_delay_us: DEFAULT_PROGRESS_DELAY_US,
            devices: None,
            err_handling_mode: ErrHandlingMode::Peer,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            enable_telemetry: false,
        }
    }
}

impl EngineConfig {
    /// Apply a string-keyed parameter. Unknown keys are ignored so
    /// backend-specific extras can share the same map; unparsable
    /// values keep the current setting.
    pub fn apply_param(&mut self, key: &str, value: &str) {
        match key {
            "striping_threshold" => match value.parse() {
                Ok(v) => self.striping_threshold = v,
                Err(_) => {
                    warn!(value, "invalid striping_threshold, keeping {}", self.striping_threshold)
                }
            },
            "num_workers" => match value.parse() {
                Ok(v) => self.num_workers = v,
                Err(_) => warn!(value, "invalid num_workers, keeping {}", self.num_workers),
            },
            "enable_progress_thread" => match value.parse() {
                Ok(v) => self.enable_progress_thread = v,
                Err(_) => warn!(value, "invalid enable_progress_thread"),
            },
            "progress_thread_delay_us" => match value.parse() {
                Ok(v) => self.progress_thread_delay_us = v,
                Err(_) => warn!(value, "invalid progress_thread_delay_us"),
            },
            "connect_timeout_ms" => match value.parse() {
                Ok(v) => self.connect_timeout_ms = v,
                Err(_) => warn!(value, "invalid connect_timeout_ms"),
            },
            "devices" => {
                self.devices = Some(value.split(',').map(|s| s.trim().to_string()).collect());
            }
            "err_handling_mode" => match value {
                "none" => self.err_handling_mode = ErrHandlingMode::None,
                "peer" => self.err_handling_mode = ErrHandlingMode::Peer,
                _ => warn!(value, "invalid err_handling_mode"),
            },
            _ => {}
        }
    }
}

/// Parameters handed to an engine at construction.
#[derive(Debug, Clone)]
pub struct InitParams {
    /// This agent's name, unique on the bootstrap channel.
    pub agent_name: String,
    /// Typed configuration.
    pub config: EngineConfig,
    custom: BTreeMap<String, String>,
}

impl InitParams {
    /// Create init params for the named agent with default config.
    pub fn new(agent_name: impl Into<String>) -> Self {
        InitParams {
            agent_name: agent_name.into(),
            config: EngineConfig::default(),
            custom: BTreeMap::new(),
        }
    }

    /// Replace the typed configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a custom parameter. A key may be registered once;
    /// known keys are also folded into the typed config.
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<()> {
        if self.custom.contains_key(key) {
            return Err(BackendError::NotAllowed { key: key.to_string() });
        }
        self.custom.insert(key.to_string(), value.to_string());
        self.config.apply_param(key, value);
        Ok(())
    }

    /// Look up a previously registered custom parameter.
    pub fn get_param(&self, key: &str) -> Result<&str> {
        self.custom
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| BackendError::invalid(format!("unknown init parameter {key}")))
    }
}
