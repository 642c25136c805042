/// Reconstruction settings, persisted as TOML in a config directory.
///
/// Every field has a serde default, so a partial `config.toml` (or none at
/// all) loads cleanly. Tick windows are in game ticks; durations reported to
/// consumers are converted with `ticks_per_second`.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Game ticks per wall-clock second.
    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: f64,

    /// How far before a first hit the detector looks for the opening attack.
    #[serde(default = "default_lookback_ticks")]
    pub lookback_ticks: i64,

    /// Inactivity after which an open fight is force-closed.
    #[serde(default = "default_timeout_ticks")]
    pub timeout_ticks: i64,

    /// Search radius when matching a fight start to a snapshot frame.
    #[serde(default = "default_snapshot_tolerance_ticks")]
    pub snapshot_tolerance_ticks: i64,

    /// Start health used when no snapshot frame is close enough.
    #[serde(default = "default_health")]
    pub default_health: f64,

    /// Loadout label for a slot that has not equipped anything this session.
    #[serde(default = "default_item")]
    pub default_item: String,

    /// Attribution label when neither the item field nor the cause rules match.
    #[serde(default = "default_unknown_item")]
    pub unknown_item: String,

    /// Worker pool bound for batch runs (0 = available parallelism).
    #[serde(default)]
    pub workers: usize,

    /// Optional TOML file replacing the embedded item attribution rules.
    #[serde(default)]
    pub rules_path: PathBuf,

    /// Directory for rolling log files (empty = stderr only).
    #[serde(default)]
    pub log_dir: PathBuf,
}

fn default_ticks_per_second() -> f64 { 60.0 }
fn default_lookback_ticks() -> i64 { 120 }
fn default_timeout_ticks() -> i64 { 240 }
fn default_snapshot_tolerance_ticks() -> i64 { 30 }
fn default_health() -> f64 { 100.0 }
fn default_item() -> String { "Default".to_owned() }
fn default_unknown_item() -> String { "Unknown".to_owned() }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ticks_per_second:         default_ticks_per_second(),
            lookback_ticks:           default_lookback_ticks(),
            timeout_ticks:            default_timeout_ticks(),
            snapshot_tolerance_ticks: default_snapshot_tolerance_ticks(),
            default_health:           default_health(),
            default_item:             default_item(),
            unknown_item:             default_unknown_item(),
            workers:                  0,
            rules_path:               PathBuf::new(),
            log_dir:                  PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Convert a tick span to seconds, never negative.
    pub fn seconds(&self, ticks: i64) -> f64 {
        if self.ticks_per_second <= 0.0 {
            return 0.0;
        }
        (ticks.max(0) as f64) / self.ticks_per_second
    }

    /// Effective worker count for the batch pool.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

pub fn load_or_default(config_dir: &Path) -> Result<AppConfig> {
    let path = config_dir.join(CONFIG_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Config parse error: {}", e))?;
        tracing::debug!("Config loaded from {:?}", path);
        Ok(cfg)
    } else {
        Ok(AppConfig::default())
    }
}

pub fn save(config: &AppConfig, config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let raw = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("Config serialize error: {}", e))?;
    std::fs::write(config_dir.join(CONFIG_FILE), raw)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_config() {
        let dir = tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.timeout_ticks  = 300;
        cfg.default_item   = "Fists".to_owned();
        cfg.workers        = 4;

        save(&cfg, dir.path()).unwrap();

        let loaded = load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn returns_default_when_missing() {
        let dir = tempdir().unwrap();
        let cfg = load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.lookback_ticks, 120);
        assert_eq!(cfg.timeout_ticks, 240);
        assert!(cfg.rules_path.as_os_str().is_empty());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "ticks_per_second = 30.0\n").unwrap();
        let cfg = load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.ticks_per_second, 30.0);
        assert_eq!(cfg.default_health, 100.0);
        assert_eq!(cfg.unknown_item, "Unknown");
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "timeout_ticks = [").unwrap();
        assert!(load_or_default(dir.path()).is_err());
    }

    #[test]
    fn seconds_conversion() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.seconds(30), 0.5);
        assert_eq!(cfg.seconds(-10), 0.0);
    }
}
