// Configuration management for the lockbridge CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/lockbridge/config.json
// - Linux: ~/.config/lockbridge/config.json
// - Windows: %APPDATA%\lockbridge\config.json
//
// Secrets live next to it in secrets.json and are never written by the CLI.

use anyhow::{Context, Result};
use lockbridge_core::{GatewayConfig, Secrets};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Everything the gateway engine consumes
    pub gateway: GatewayConfig,

    /// HTTP control surface
    pub http: HttpConfig,

    /// Storage path for keys, settings and the peripheral log
    pub storage_path: Option<String>,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Daily-rolling JSON log files are written here when set
    pub directory: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse::<T>().context("Invalid number")
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("lockbridge");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("lockbridge");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn secrets_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("secrets.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config.normalized())
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.gateway = self.gateway.normalized();
        self
    }

    /// Load secrets.json; the gateway refuses to start without it
    pub fn load_secrets() -> Result<Secrets> {
        Self::load_secrets_from(&Self::secrets_file()?)
    }

    pub fn load_secrets_from(path: &Path) -> Result<Secrets> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read secrets file {}", path.display()))?;
        let secrets: Secrets =
            serde_json::from_str(&contents).context("Failed to parse secrets file")?;
        if secrets.lock_secret.is_empty() {
            anyhow::bail!("secrets file has no lock_secret");
        }
        Ok(secrets)
    }

    /// Where the sled store lives
    pub fn storage_dir(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("store")),
        }
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let gateway = &mut self.gateway;
        match key {
            "rfid_address" => gateway.peripherals.rfid_address = value.trim().to_lowercase(),
            "lock_address" => gateway.peripherals.lock_address = value.trim().to_lowercase(),
            "test_address" => {
                gateway.peripherals.test_address = optional(&value.trim().to_lowercase())
            }
            "subscription_delay_ms" => {
                gateway.connection.subscription_delay_ms = parse_number(value)?
            }
            "heartbeat_interval_ms" => {
                gateway.connection.heartbeat_interval_ms = parse_number(value)?
            }
            "flush_interval_ms" => gateway.outbox.flush_interval_ms = parse_number(value)?,
            "max_queue_depth" => gateway.outbox.max_queue_depth = parse_number(value)?,
            "response_timeout_ms" => gateway.engine.response_timeout_ms = parse_number(value)?,
            "history_limit" => gateway.engine.history_limit = parse_number(value)?,
            "initial_sync_delay_ms" => gateway.lock.initial_sync_delay_ms = parse_number(value)?,
            "bind_address" => self.http.bind_address = value.to_string(),
            "listen_port" => {
                self.http.listen_port = value.parse().context("Invalid port number")?;
            }
            "storage_path" => self.storage_path = optional(value),
            "log_level" => self.logging.level = value.to_string(),
            "log_directory" => self.logging.directory = optional(value),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let gateway = &self.gateway;
        let or_unset = |value: &Option<String>| value.clone().unwrap_or_else(|| "(unset)".to_string());
        vec![
            ("rfid_address".to_string(), gateway.peripherals.rfid_address.clone()),
            ("lock_address".to_string(), gateway.peripherals.lock_address.clone()),
            ("test_address".to_string(), or_unset(&gateway.peripherals.test_address)),
            (
                "subscription_delay_ms".to_string(),
                gateway.connection.subscription_delay_ms.to_string(),
            ),
            (
                "heartbeat_interval_ms".to_string(),
                gateway.connection.heartbeat_interval_ms.to_string(),
            ),
            ("flush_interval_ms".to_string(), gateway.outbox.flush_interval_ms.to_string()),
            ("max_queue_depth".to_string(), gateway.outbox.max_queue_depth.to_string()),
            ("response_timeout_ms".to_string(), gateway.engine.response_timeout_ms.to_string()),
            ("history_limit".to_string(), gateway.engine.history_limit.to_string()),
            (
                "initial_sync_delay_ms".to_string(),
                gateway.lock.initial_sync_delay_ms.to_string(),
            ),
            ("bind_address".to_string(), self.http.bind_address.clone()),
            ("listen_port".to_string(), self.http.listen_port.to_string()),
            (
                "storage_path".to_string(),
                self.storage_path.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
            ("log_level".to_string(), self.logging.level.clone()),
            ("log_directory".to_string(), or_unset(&self.logging.directory)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.http.listen_port, 8080);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.gateway.outbox.delimiter, ";");
    }

    #[test]
    fn test_apply_and_get() {
        let mut config = Config::default();
        config.apply("lock_address", "AA:BB:CC:DD:EE:02").unwrap();
        config.apply("response_timeout_ms", "2500").unwrap();
        config.apply("log_directory", "/var/log/lockbridge").unwrap();

        assert_eq!(config.get("lock_address").unwrap(), "aa:bb:cc:dd:ee:02");
        assert_eq!(config.gateway.engine.response_timeout_ms, 2500);
        assert_eq!(
            config.logging.directory.as_deref(),
            Some("/var/log/lockbridge")
        );

        config.apply("log_directory", "").unwrap();
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_apply_rejects_bad_input() {
        let mut config = Config::default();
        assert!(config.apply("listen_port", "not-a-port").is_err());
        assert!(config.apply("no_such_key", "1").is_err());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.http.listen_port, 8080);

        let mut changed = config.clone();
        changed.apply("listen_port", "9000").unwrap();
        changed.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().http.listen_port, 9000);
    }

    #[test]
    fn test_secrets_require_lock_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");

        assert!(Config::load_secrets_from(&path).is_err());

        std::fs::write(&path, r#"{"api_token": "t"}"#).unwrap();
        assert!(Config::load_secrets_from(&path).is_err());

        std::fs::write(&path, r#"{"lock_secret": "s", "api_token": "t"}"#).unwrap();
        let secrets = Config::load_secrets_from(&path).unwrap();
        assert_eq!(secrets.lock_secret, "s");
        assert_eq!(secrets.api_token, "t");
    }
}
