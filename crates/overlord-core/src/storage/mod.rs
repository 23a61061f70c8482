mod config;
pub mod database;
mod instances;
mod journeys;
pub mod migrations;
mod profiles;

pub use config::{Config, DeliveryConfig, JourneysConfig, LoggingConfig, SchedulingConfig};
pub use database::{AlarmDb, SharedDb};

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns the data directory, creating it if needed.
///
/// `OVERLORD_DATA_DIR` wins when set. Otherwise `~/.config/overlord[-dev]/`,
/// with `OVERLORD_ENV=dev` selecting the development directory.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("OVERLORD_DATA_DIR") {
        Some(custom) if !custom.is_empty() => PathBuf::from(custom),
        _ => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");

            let env = std::env::var("OVERLORD_ENV").unwrap_or_else(|_| "production".to_string());

            if env == "dev" {
                base_dir.join("overlord-dev")
            } else {
                base_dir.join("overlord")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
