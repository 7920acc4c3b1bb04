//! Engine configuration. Defaults are tuned for a long-running service;
//! tests typically shrink the intervals or run fully in memory.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Directory for durable state. `None` keeps everything in memory.
    pub storage_dir: Option<PathBuf>,
    /// How often the threat sweep inspects the recent event window.
    pub sweep_interval: Duration,
    /// How often the vulnerability scan runs.
    pub scan_interval: Duration,
    /// How often a metrics snapshot is published.
    pub metrics_interval: Duration,
    /// How often scheduled key rotations are checked.
    pub rotation_check_interval: Duration,
    /// Activity-spike threshold as a multiple of the weekly baseline.
    pub anomaly_multiplier: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            sweep_interval: Duration::from_secs(300),
            scan_interval: Duration::from_secs(900),
            metrics_interval: Duration::from_secs(300),
            rotation_check_interval: Duration::from_secs(3600),
            anomaly_multiplier: 3.0,
        }
    }
}

impl EngineConfig {
    pub fn with_storage_dir(dir: impl Into<PathBuf>) -> Self {
        Self { storage_dir: Some(dir.into()), ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert!(cfg.storage_dir.is_none());
        assert_eq!(cfg.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.anomaly_multiplier, 3.0);
    }

    #[test]
    fn test_with_storage_dir() {
        let cfg = EngineConfig::with_storage_dir("/tmp/aegis");
        assert_eq!(cfg.storage_dir.as_deref(), Some(std::path::Path::new("/tmp/aegis")));
    }
}
