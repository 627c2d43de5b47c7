use std::path::Path;

use anyhow::{Context, Result};
use cardscan_dispatch::DispatchConfig;
use serde::{Deserialize, Serialize};

/// Daemon settings. Loaded from an optional TOML file, then overridden by
/// command-line flags.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listen address, e.g. 127.0.0.1:8000
    pub listen: String,
    /// Accepted `X-API-KEY` values. Empty disables the check.
    pub api_keys: Vec<String>,
    /// Simulated per-image latency of the demo model.
    pub demo_latency_ms: u64,
    pub dispatch: DispatchConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            api_keys: Vec::new(),
            demo_latency_ms: 200,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: DaemonConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn auth_required(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn accepts_key(&self, key: Option<&str>) -> bool {
        if !self.auth_required() {
            return true;
        }
        key.is_some_and(|k| self.api_keys.iter().any(|allowed| allowed == k))
    }
}
