//! Engine configuration (§10 "Configuration"). Serde-derived, loaded
//! from an optional TOML file with environment overrides and
//! programmatic defaults — the same role `connection::config` plays for
//! this codebase's original connection pool.

use crate::core::{Result, SettingsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsEngineConfig {
    /// Root directory under which local database directories are created.
    pub database_root: PathBuf,
    /// How often the background worker polls `*.changes` stamps (§4.7).
    pub changes_poll_interval_ms: u64,
    /// Size threshold above which a blob write picks the `Cab` codec (§4.2).
    pub codec_threshold_bytes: usize,
    /// Backoff between sync retries after a remote failure (§7).
    pub sync_retry_backoff_ms: u64,
    /// Whether `DatabaseHandle::init` starts the background worker automatically.
    pub worker_auto_start: bool,
}

impl Default for SettingsEngineConfig {
    fn default() -> Self {
        SettingsEngineConfig {
            database_root: PathBuf::from("."),
            changes_poll_interval_ms: 500,
            codec_threshold_bytes: 4096,
            sync_retry_backoff_ms: 1000,
            worker_auto_start: true,
        }
    }
}

impl SettingsEngineConfig {
    /// Loads defaults, then an optional TOML file, then environment
    /// overrides (`CFGSYNC_DATABASE_ROOT`, `CFGSYNC_CHANGES_POLL_INTERVAL_MS`,
    /// `CFGSYNC_CODEC_THRESHOLD_BYTES`, `CFGSYNC_SYNC_RETRY_BACKOFF_MS`,
    /// `CFGSYNC_WORKER_AUTO_START`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)
                    .map_err(|e| SettingsError::InvalidFormat(format!("config: {e}")))?
            }
            _ => SettingsEngineConfig::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CFGSYNC_DATABASE_ROOT") {
            self.database_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CFGSYNC_CHANGES_POLL_INTERVAL_MS") {
            self.changes_poll_interval_ms = parse_env("CFGSYNC_CHANGES_POLL_INTERVAL_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CFGSYNC_CODEC_THRESHOLD_BYTES") {
            self.codec_threshold_bytes = parse_env("CFGSYNC_CODEC_THRESHOLD_BYTES", &v)?;
        }
        if let Ok(v) = std::env::var("CFGSYNC_SYNC_RETRY_BACKOFF_MS") {
            self.sync_retry_backoff_ms = parse_env("CFGSYNC_SYNC_RETRY_BACKOFF_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CFGSYNC_WORKER_AUTO_START") {
            self.worker_auto_start = parse_env("CFGSYNC_WORKER_AUTO_START", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| SettingsError::InvalidFormat(format!("invalid value for {name}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SettingsEngineConfig::default();
        assert!(config.worker_auto_start);
        assert_eq!(config.codec_threshold_bytes, 4096);
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfgsync.toml");
        std::fs::write(&path, "codec_threshold_bytes = 1024\nworker_auto_start = false\n").unwrap();
        let config = SettingsEngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.codec_threshold_bytes, 1024);
        assert!(!config.worker_auto_start);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let config = SettingsEngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.codec_threshold_bytes, SettingsEngineConfig::default().codec_threshold_bytes);
    }
}
