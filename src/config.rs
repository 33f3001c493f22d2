//! Startup configuration for the graph and the formula layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable switching formula support on or off.
pub const ENV_FORMULAS_ENABLED: &str = "PATH_FLOW_FORMULAS_ENABLED";
/// Environment variable holding the drain interval in milliseconds (0 = manual).
pub const ENV_DRAIN_INTERVAL_MS: &str = "PATH_FLOW_DRAIN_INTERVAL_MS";
/// Environment variable holding the worker pool size.
pub const ENV_WORKER_THREADS: &str = "PATH_FLOW_WORKER_THREADS";

const DEFAULT_DRAIN_INTERVAL_MS: u64 = 500;
const DEFAULT_WORKER_THREADS: usize = 3;

/// Configuration of a [`CachedObjectGraph`](crate::CachedObjectGraph).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Read properties without blocking; unloaded values resolve to
    /// [`Value::NotReady`](crate::Value::NotReady) until they arrive.
    pub asynchronous: bool,
}

/// Configuration of a [`FormulaEnabledGraph`](crate::FormulaEnabledGraph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormulaConfig {
    /// Whether formula paths may be registered at all.
    pub enabled: bool,
    /// Fixed delay between drains. `None` disables the background drain;
    /// call [`FormulaEnabledGraph::drain_now`](crate::FormulaEnabledGraph::drain_now)
    /// instead.
    pub drain_interval_ms: Option<u64>,
    /// Size of the background worker pool.
    pub worker_threads: usize,
}

impl Default for FormulaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drain_interval_ms: Some(DEFAULT_DRAIN_INTERVAL_MS),
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl FormulaConfig {
    /// Formulas enabled, drained only by explicit `drain_now` calls.
    pub fn manual() -> Self {
        Self {
            drain_interval_ms: None,
            ..Self::default()
        }
    }

    /// The drain delay, if background draining is configured.
    pub fn drain_interval(&self) -> Option<Duration> {
        self.drain_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, falling back to defaults for
    /// missing or unparsable entries.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_FORMULAS_ENABLED) {
            match parse_bool(&raw) {
                Some(enabled) => config.enabled = enabled,
                None => warn!(key = ENV_FORMULAS_ENABLED, value = %raw, "ignoring unparsable setting"),
            }
        }

        if let Some(raw) = lookup(ENV_DRAIN_INTERVAL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(0) => config.drain_interval_ms = None,
                Ok(ms) => config.drain_interval_ms = Some(ms),
                Err(_) => warn!(key = ENV_DRAIN_INTERVAL_MS, value = %raw, "ignoring unparsable setting"),
            }
        }

        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.worker_threads = n,
                _ => warn!(key = ENV_WORKER_THREADS, value = %raw, "ignoring unparsable setting"),
            }
        }

        config
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
