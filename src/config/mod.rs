//! Application configuration.
//!
//! Loaded from YAML files layered with environment variables.

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "notibus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NOTIBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NOTIBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "NOTIBUS_LOG";

use serde::Deserialize;

use crate::bus::BusConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Notification bus configuration.
    pub bus: BusConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `notibus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `NOTIBUS__BUS__DRIVER=redis`
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serial_test::serial;

    use super::*;
    use crate::bus::BusDriver;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.bus.driver.is_none());
    }

    #[test]
    #[serial]
    fn test_config_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "bus:\n  driver: nats\n  url: nats://broker:4222").unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.bus.driver, Some(BusDriver::Nats));
        assert_eq!(config.bus.broker_url(), "nats://broker:4222");
    }

    #[test]
    #[serial]
    fn test_config_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "bus:\n  driver: nats").unwrap();

        std::env::set_var("NOTIBUS__BUS__DRIVER", "redis");
        let result = Config::load(file.path().to_str());
        std::env::remove_var("NOTIBUS__BUS__DRIVER");

        assert_eq!(result.unwrap().bus.driver, Some(BusDriver::Redis));
    }

    #[test]
    #[serial]
    fn test_config_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/notibus.yaml")).is_err());
    }
}
