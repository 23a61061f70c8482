//! TOML-based application configuration.
//!
//! Stores user preferences including:
//! - Delivery defaults (auto-stop fallback, vibration waveform, sound)
//! - Wake scheduling behaviour (exact wake permission, inexact window, resync)
//! - Journey retention
//! - Log filter
//!
//! Configuration is stored at `<data_dir>/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::error::ConfigError;
use crate::profile::DEFAULT_AUTO_STOP_SECS;

/// Alert delivery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Auto-stop applied when an alarm needs no dismissal and has no duration.
    #[serde(default = "default_auto_stop_secs")]
    pub default_auto_stop_secs: u32,
    /// Vibration waveform in milliseconds (off/on pairs), repeated until stopped.
    #[serde(default = "default_vibration_pattern")]
    pub vibration_pattern_ms: Vec<u64>,
    #[serde(default = "default_sound_name")]
    pub default_sound_name: String,
}

/// Wake scheduling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default = "default_true")]
    pub exact_wake_permitted: bool,
    /// Inexact wakes are rounded up to a multiple of this window.
    #[serde(default = "default_inexact_window_secs")]
    pub inexact_window_secs: u64,
    /// How often the daemon re-reads the store and re-arms.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
}

/// Journey lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneysConfig {
    /// Minutes after departure before a journey is considered completed.
    #[serde(default = "default_completion_grace_minutes")]
    pub completion_grace_minutes: u32,
    /// Days a completed journey is kept before it is deleted.
    #[serde(default = "default_retain_completed_days")]
    pub retain_completed_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

/// Application configuration.
///
/// Serialized to/from TOML at `<data_dir>/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub journeys: JourneysConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_auto_stop_secs() -> u32 {
    DEFAULT_AUTO_STOP_SECS
}
fn default_vibration_pattern() -> Vec<u64> {
    vec![0, 500, 500, 500, 500, 500]
}
fn default_sound_name() -> String {
    "Default Alarm".into()
}
fn default_true() -> bool {
    true
}
fn default_inexact_window_secs() -> u64 {
    60
}
fn default_resync_interval_secs() -> u64 {
    60
}
fn default_completion_grace_minutes() -> u32 {
    60
}
fn default_retain_completed_days() -> u32 {
    30
}
fn default_log_filter() -> String {
    "info".into()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_auto_stop_secs: default_auto_stop_secs(),
            vibration_pattern_ms: default_vibration_pattern(),
            default_sound_name: default_sound_name(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            exact_wake_permitted: true,
            inexact_window_secs: default_inexact_window_secs(),
            resync_interval_secs: default_resync_interval_secs(),
        }
    }
}

impl Default for JourneysConfig {
    fn default() -> Self {
        Self {
            completion_grace_minutes: default_completion_grace_minutes(),
            retain_completed_days: default_retain_completed_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value
                            .parse::<bool>()
                            .map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => value
                        .parse::<u64>()
                        .map(|n| serde_json::Value::Number(n.into()))
                        .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?,
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default location of the config file.
    ///
    /// # Errors
    /// Returns an error if the data directory cannot be created.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if the file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    /// Load from `path`, writing defaults there if the file is missing.
    ///
    /// # Errors
    /// See [`Config::load`].
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
            Err(e) => Err(ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }

    /// Persist to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    /// # Errors
    /// See [`Config::save`].
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key without saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed
    /// or fails validation.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config =
            serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// # Errors
    /// Returns the first value that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.delivery.default_auto_stop_secs == 0 {
            return Err(invalid("delivery.default_auto_stop_secs", "must be positive"));
        }
        if self.delivery.vibration_pattern_ms.is_empty() {
            return Err(invalid("delivery.vibration_pattern_ms", "must not be empty"));
        }
        if self.scheduling.resync_interval_secs == 0 {
            return Err(invalid("scheduling.resync_interval_secs", "must be positive"));
        }
        Ok(())
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to default configuration");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: Config = toml::from_str("[scheduling]\nexact_wake_permitted = false\n").unwrap();
        assert!(!parsed.scheduling.exact_wake_permitted);
        assert_eq!(parsed.scheduling.inexact_window_secs, 60);
        assert_eq!(parsed.delivery.default_auto_stop_secs, 30);
        assert_eq!(parsed.logging.filter, "info");
    }

    #[test]
    fn get_supports_dot_path_keys() {
        let cfg = Config::default();
        assert_eq!(
            cfg.get("scheduling.exact_wake_permitted").as_deref(),
            Some("true")
        );
        assert_eq!(cfg.get("delivery.default_auto_stop_secs").as_deref(), Some("30"));
        assert_eq!(
            cfg.get("delivery.vibration_pattern_ms").as_deref(),
            Some("[0,500,500,500,500,500]")
        );
        assert!(cfg.get("delivery.missing_key").is_none());
    }

    #[test]
    fn set_updates_typed_values() {
        let mut cfg = Config::default();
        cfg.set("scheduling.exact_wake_permitted", "false").unwrap();
        cfg.set("journeys.retain_completed_days", "7").unwrap();
        cfg.set("logging.filter", "overlord_core=debug").unwrap();
        cfg.set("delivery.vibration_pattern_ms", "[0, 250, 250]").unwrap();

        assert!(!cfg.scheduling.exact_wake_permitted);
        assert_eq!(cfg.journeys.retain_completed_days, 7);
        assert_eq!(cfg.logging.filter, "overlord_core=debug");
        assert_eq!(cfg.delivery.vibration_pattern_ms, vec![0, 250, 250]);
    }

    #[test]
    fn set_rejects_unknown_key_and_bad_values() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.set("delivery.nonexistent_key", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            cfg.set("scheduling.exact_wake_permitted", "not_a_bool"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.set("delivery.default_auto_stop_secs", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn load_from_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg, Config::default());
        assert!(path.exists());

        let mut changed = cfg.clone();
        changed.set("scheduling.inexact_window_secs", "300").unwrap();
        changed.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().scheduling.inexact_window_secs, 300);
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "delivery = 5").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::LoadFailed { .. })
        ));
    }
}
