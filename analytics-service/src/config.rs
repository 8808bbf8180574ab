//! Analytics service configuration: optional TOML file (`ANALYTICS_CONFIG`,
//! default [`DEFAULT_CONFIG_PATH`]) under `ANALYTICS__<KEY>` env overrides.

use chrono::FixedOffset;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use telemetry_model::Interval;

pub const DEFAULT_CONFIG_PATH: &str = "config/analytics.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub http_addr: String,
    /// Display zone as minutes east of UTC; +07:00 (WIB) by default.
    pub display_offset_minutes: i32,
    pub default_interval: String,
    pub max_connections: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:5001".to_string(),
            display_offset_minutes: 7 * 60,
            default_interval: Interval::FiveMinutes.as_str().to_string(),
            max_connections: 10,
        }
    }
}

impl AnalyticsConfig {
    pub fn display_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.display_offset_minutes * 60).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "display_offset_minutes {} is out of range",
                self.display_offset_minutes
            ))
        })
    }

    pub fn default_interval(&self) -> Result<Interval, ConfigError> {
        self.default_interval
            .parse()
            .map_err(|e: telemetry_model::UnknownInterval| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.display_offset()?;
        self.default_interval()?;
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        Ok(())
    }

    pub fn log_summary(&self) {
        info!(
            http_addr = %self.http_addr,
            display_offset_minutes = self.display_offset_minutes,
            default_interval = %self.default_interval,
            "analytics-service configuration loaded"
        );
    }
}

pub fn load() -> Result<AnalyticsConfig, ConfigError> {
    let path =
        std::env::var("ANALYTICS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from_path(&path)
}

pub fn load_from_path(path: &str) -> Result<AnalyticsConfig, ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Toml).required(false))
        .add_source(config::Environment::with_prefix("ANALYTICS").separator("__"))
        .build()?;
    let cfg: AnalyticsConfig = settings.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
