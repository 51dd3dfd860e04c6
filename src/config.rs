//! Engine configuration.
//!
//! Resolution order per setting: explicit value, environment variable,
//! built-in default. `.env` files are honored through `dotenvy`.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for wiring an engine instance.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Directories scanned for flow documents at startup.
    pub flow_dirs: Vec<PathBuf>,
    /// Root of the session store.
    pub store_dir: PathBuf,
    /// Outbox poll interval.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_dirs: vec![
                PathBuf::from("config/workflows"),
                PathBuf::from("config/workflows/subflows"),
            ],
            store_dir: PathBuf::from("storage/sessions"),
            poll_interval: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `LOOMFLOW_FLOW_DIRS` — `:`-separated directory list
    /// - `LOOMFLOW_STORE_DIR`
    /// - `LOOMFLOW_POLL_INTERVAL_SECS`
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(dirs) = std::env::var("LOOMFLOW_FLOW_DIRS") {
            let parsed: Vec<PathBuf> = dirs
                .split(':')
                .filter(|part| !part.is_empty())
                .map(PathBuf::from)
                .collect();
            if !parsed.is_empty() {
                config.flow_dirs = parsed;
            }
        }
        if let Ok(dir) = std::env::var("LOOMFLOW_STORE_DIR") {
            if !dir.is_empty() {
                config.store_dir = PathBuf::from(dir);
            }
        }
        if let Ok(secs) = std::env::var("LOOMFLOW_POLL_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse::<f64>() {
                if secs > 0.0 {
                    config.poll_interval = Duration::from_secs_f64(secs);
                }
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.store_dir, PathBuf::from("storage/sessions"));
        assert_eq!(config.flow_dirs.len(), 2);
    }
}
