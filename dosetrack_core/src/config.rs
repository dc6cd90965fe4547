//! Configuration file support for Dosetrack.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/dosetrack/config.toml`.
//! This is application configuration (where files live, defaults for the
//! CLI); persisted business configuration lives in `Settings`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub forecast: ForecastConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Schedule generation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_total_doses")]
    pub default_total_doses: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_total_doses: default_total_doses(),
        }
    }
}

/// Stock forecast configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_lead_time_days")]
    pub lead_time_days: i64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            lead_time_days: default_lead_time_days(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").expect("HOME environment variable not set");
        PathBuf::from(home).join(".local/share")
    });
    base.join("dosetrack")
}

fn default_total_doses() -> u32 {
    crate::schedule::DEFAULT_TOTAL_DOSES
}

fn default_lead_time_days() -> i64 {
    10
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").expect("HOME environment variable not set");
            PathBuf::from(home).join(".config")
        });
        base.join("dosetrack").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.schedule.default_total_doses, 12);
        assert_eq!(config.forecast.lead_time_days, 10);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(
            config.schedule.default_total_doses,
            parsed.schedule.default_total_doses
        );
        assert_eq!(config.forecast.lead_time_days, parsed.forecast.lead_time_days);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[forecast]
lead_time_days = 21
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.forecast.lead_time_days, 21);
        assert_eq!(config.schedule.default_total_doses, 12); // default
    }
}
