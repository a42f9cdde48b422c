//! ReplIMap Configuration
//!
//! Tunables for observer delivery and logging. Everything has a default,
//! so an empty TOML document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main ReplIMap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfig {
    /// Observer delivery configuration
    #[serde(default)]
    pub observers: ObserverConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Observer delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Minimum capacity of the bounded queue behind a channel observer
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_queue_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl MapConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MapConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.observers.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "observers.queue_capacity must be greater than zero".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be \"pretty\" or \"compact\", got \"{}\"",
                    other
                )))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[observers]
queue_capacity = 64

[logging]
level = "debug"
format = "compact"
"#;

        let config = MapConfig::from_str(toml).unwrap();
        assert_eq!(config.observers.queue_capacity, 64);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MapConfig::from_str("").unwrap();
        assert_eq!(config.observers.queue_capacity, 1024);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero = "[observers]\nqueue_capacity = 0\n";
        assert!(matches!(MapConfig::from_str(zero), Err(crate::Error::Config(_))));

        let json = "[logging]\nformat = \"json\"\n";
        assert!(matches!(MapConfig::from_str(json), Err(crate::Error::Config(_))));

        let garbage = "[observers\n";
        assert!(matches!(MapConfig::from_str(garbage), Err(crate::Error::ConfigParse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[observers]\nqueue_capacity = 8").unwrap();

        let config = MapConfig::from_file(file.path()).unwrap();
        assert_eq!(config.observers.queue_capacity, 8);
    }
}
