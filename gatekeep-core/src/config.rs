//! Engine configuration

use crate::error::{ErrorContext, GatekeepError, GatekeepResult};
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the authorization engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on every store call made from the decision path, in milliseconds.
    /// Elapsed timeouts fail closed (deny).
    pub store_timeout_ms: u64,
    /// Hard bound on hierarchy traversal depth; the visited set catches
    /// cycles, this catches pathological chains
    pub max_hierarchy_depth: usize,
    /// Permission name that authorizes administrative mutations
    /// (hierarchy changes, publishing) on a resource
    pub admin_permission: String,
    /// Permission name that authorizes sharing (granting/revoking/delegating)
    pub share_permission: String,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            max_hierarchy_depth: 32,
            admin_permission: "manage".to_string(),
            share_permission: "share".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> GatekeepResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| GatekeepError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| GatekeepError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> GatekeepResult<()> {
        if self.store_timeout_ms == 0 {
            return Err(GatekeepError::Config {
                message: "store_timeout_ms must be greater than 0".to_string(),
                source: None,
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set store_timeout_ms to a positive value"),
            });
        }

        if self.max_hierarchy_depth == 0 {
            return Err(GatekeepError::Config {
                message: "max_hierarchy_depth must be greater than 0".to_string(),
                source: None,
                context: ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set max_hierarchy_depth to a positive value"),
            });
        }

        if self.admin_permission.is_empty() || self.share_permission.is_empty() {
            return Err(GatekeepError::Config {
                message: "admin_permission and share_permission must not be empty".to_string(),
                source: None,
                context: ErrorContext::new("config").with_operation("validate"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = EngineConfig {
            store_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
