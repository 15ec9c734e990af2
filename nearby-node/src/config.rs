//! Load node config from file and environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use nearby_core::{CoreConfig, Strategy};
use serde::Deserialize;
use tracing::warn;

/// Node configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_ENDPOINT_NAME, NEARBY_STRATEGY_ID, NEARBY_TICK_INTERVAL_MS,
/// NEARBY_SERVICE_ID, NEARBY_STALENESS_TIMEOUT_MS, NEARBY_HANDSHAKE_TIMEOUT_MS,
/// NEARBY_CHUNK_SIZE.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Name advertised to other endpoints (default "nearby-node").
    #[serde(default = "default_endpoint_name")]
    pub endpoint_name: String,
    /// Topology used for advertising and discovery: 0 cluster, 1 star,
    /// 2 point-to-point (default 0).
    #[serde(default)]
    pub strategy_id: u32,
    /// How often the coordinator drives timers (default 250ms).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Protocol tunables, the `[core]` table.
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_endpoint_name() -> String {
    "nearby-node".to_owned()
}
fn default_tick_interval_ms() -> u64 {
    250
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            endpoint_name: default_endpoint_name(),
            strategy_id: 0,
            tick_interval_ms: default_tick_interval_ms(),
            core: CoreConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn strategy(&self) -> nearby_core::Result<Strategy> {
        Strategy::from_id(self.strategy_id)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Values that do not parse are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("NEARBY_ENDPOINT_NAME") {
            self.endpoint_name = name;
        }
        if let Some(v) = parsed(&lookup, "NEARBY_STRATEGY_ID") {
            self.strategy_id = v;
        }
        if let Some(v) = parsed(&lookup, "NEARBY_TICK_INTERVAL_MS") {
            self.tick_interval_ms = v;
        }
        if let Some(id) = lookup("NEARBY_SERVICE_ID") {
            self.core.service_id = id;
        }
        if let Some(v) = parsed(&lookup, "NEARBY_STALENESS_TIMEOUT_MS") {
            self.core.staleness_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "NEARBY_HANDSHAKE_TIMEOUT_MS") {
            self.core.handshake_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "NEARBY_CHUNK_SIZE") {
            self.core.chunk_size = v;
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

/// Parse a config file body.
pub fn parse(s: &str) -> Result<NodeConfig, toml::de::Error> {
    toml::from_str(s)
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NodeConfig {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|key| std::env::var(key).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

/// First existing file wins; a broken file means defaults, not a fall-through.
fn load_file() -> Option<NodeConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(e) => {
            warn!(path = %path.display(), "cannot read config: {e}");
            return None;
        }
    };
    match parse(&body) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), "invalid config: {e}");
            None
        }
    }
}
