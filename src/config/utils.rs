use super::schemas::Config;
/// Configuration utilities - loading and access helpers
///
/// - Loading configuration from disk (TOML, defaults when missing)
/// - Thread-safe access helpers
use once_cell::sync::OnceCell;
use std::sync::RwLock;

use crate::errors::{BrokerError, BrokerResult};

/// Global configuration instance
///
/// This is the single source of truth for all configuration values.
/// Access it using the helper functions below.
pub static CONFIG: OnceCell<RwLock<Config>> = OnceCell::new();

/// Default configuration file path
pub const CONFIG_FILE_PATH: &str = "data/config.toml";

/// Read and validate a configuration file without touching the global
///
/// A missing file yields the defaults. Read failures surface as
/// `BrokerError::Io`, parse and validation failures as `BrokerError::Config`.
pub fn read_config_file(path: &str) -> BrokerResult<Config> {
    let config = if std::path::Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)?;

        toml::from_str::<Config>(&contents).map_err(|e| {
            BrokerError::Config(format!("Failed to parse config file '{}': {}", path, e))
        })?
    } else {
        Config::default()
    };

    config.broker.validate().map_err(BrokerError::Config)?;
    Ok(config)
}

/// Load configuration from a file path and initialize the global CONFIG
///
/// This should be called once at startup. If the config file doesn't exist,
/// default values from the schema definitions are used.
pub fn load_config_from_path(path: &str) -> BrokerResult<()> {
    let config = read_config_file(path)?;

    CONFIG
        .set(RwLock::new(config))
        .map_err(|_| BrokerError::Config("Config already initialized".to_string()))
}

/// Execute a function with read access to the configuration
///
/// Falls back to defaults when `load_config_from_path()` has not run, so library code
/// and tests never have to initialize the global first.
pub fn with_config<F, R>(f: F) -> R
where
    F: FnOnce(&Config) -> R,
{
    match CONFIG.get().map(|lock| lock.read()) {
        Some(Ok(config)) => f(&config),
        Some(Err(poisoned)) => f(&poisoned.into_inner()),
        None => f(&Config::default()),
    }
}

/// Get a clone of the entire configuration
///
/// Useful when values must be held across await points.
pub fn get_config_clone() -> Config {
    with_config(|cfg| cfg.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[broker]\nping_interval_secs = 2\npong_timeout_secs = 6\n\n[demo]\nsystem_enabled = false"
        )
        .unwrap();

        let cfg = read_config_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.broker.ping_interval_secs, 2);
        assert_eq!(cfg.broker.pong_timeout_secs, 6);
        assert!(!cfg.demo.system_enabled);
        assert_eq!(cfg.webserver.port, 8080);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = read_config_file("/nonexistent/statebroker/config.toml").unwrap();
        assert_eq!(cfg.broker.inbound_queue_capacity, 10);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nsend_queue_capacity = 0").unwrap();
        let err = read_config_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, BrokerError::Config(ref msg) if msg.contains("send_queue_capacity")));
        assert_eq!(err.code(), "config");
    }

    #[test]
    fn test_unparseable_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker\nping_interval_secs = ").unwrap();
        let err = read_config_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, BrokerError::Config(_)));
    }

    #[test]
    fn test_unreadable_path_is_io_error() {
        // A directory exists but cannot be read as a file
        let dir = tempfile::tempdir().unwrap();
        let err = read_config_file(dir.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)));
        assert_eq!(err.code(), "io");
    }
}
