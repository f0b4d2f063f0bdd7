//! Configuration loader with environment variable expansion

use super::{expand_env_vars, Config, ConfigError};
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Config, ConfigError> {
        let expanded = expand_env_vars(content);
        // An empty file is a valid, all-defaults configuration
        let config: Config = if expanded.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&expanded)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, otherwise defaults, then overlay the environment
    pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }
}
