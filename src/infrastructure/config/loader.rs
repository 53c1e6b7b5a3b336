use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port: {0}. Must be non-zero")]
    InvalidPort(u16),

    #[error("Invalid webhook path: {0:?}. Must be a single non-empty path segment")]
    InvalidWebhookPath(String),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid {0}: must be at least 1")]
    ZeroCapacity(&'static str),

    #[error("Price table cannot be empty")]
    EmptyPriceTable,

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .callhook/config.yaml (project config)
    /// 3. .callhook/local.yaml (local overrides, optional)
    /// 4. Environment variables (CALLHOOK_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment(Yaml::file(".callhook/config.yaml"))
            .merge(Yaml::file(".callhook/local.yaml"))
            .merge(Env::prefixed("CALLHOOK_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honouring environment overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Self::figment(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CALLHOOK_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment(file: figment::providers::Data<Yaml>) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(file)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.server.port == 0 {
            return Err(ConfigError::InvalidPort(config.server.port));
        }

        let path = &config.server.webhook_path;
        let valid_segment = !path.is_empty()
            && path
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_segment {
            return Err(ConfigError::InvalidWebhookPath(path.clone()));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let capacities = [
            ("cache.capacity", config.cache.capacity),
            ("gateway.default_page_size", config.gateway.default_page_size),
            ("gateway.aggregate_row_ceiling", config.gateway.aggregate_row_ceiling),
            ("gateway.metrics_capacity", config.gateway.metrics_capacity),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroCapacity(name));
        }

        if config.tools.availability_days == 0 {
            return Err(ConfigError::ZeroCapacity("tools.availability_days"));
        }

        if config.pricing.base_rates.is_empty() {
            return Err(ConfigError::EmptyPriceTable);
        }

        for area in &config.pricing.service_areas {
            if area.prefix.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "service area '{}' has an empty postal-code prefix",
                    area.region
                )));
            }
        }

        // Validate logging config
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
