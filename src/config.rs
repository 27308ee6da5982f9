use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(rename = "Global")]
    pub global: GlobalConfig,
    #[serde(rename = "Web", default)]
    pub web: WebConfig,
    #[serde(rename = "Scanner", default)]
    pub scanner: ScannerConfig,
    #[serde(rename = "Device", default)]
    pub device: DeviceConfig,
    #[serde(rename = "Ping", default)]
    pub ping: PingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    #[serde(rename = "Debug", default)]
    pub debug: bool,
    #[serde(rename = "LogLevel", default = "default_log_level")]
    pub log_level: String,
    #[serde(rename = "PoolSize", default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(rename = "Port", default = "default_web_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Seconds between scan-all commands; also the minimum age of a
    /// network's last scan before it is swept again.
    #[serde(rename = "IntervalNet", default = "default_interval_net")]
    pub interval_net: u64,
    /// Seconds between device probe sweeps.
    #[serde(rename = "IntervalDev", default = "default_interval_dev")]
    pub interval_dev: u64,
    #[serde(rename = "Workers", default = "default_scan_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(rename = "LiveTimeout", default = "default_live_timeout")]
    pub live_timeout: u64,
    #[serde(rename = "IntervalUpdates", default = "default_interval_updates")]
    pub interval_updates: u64,
    #[serde(rename = "User", default = "default_ssh_user")]
    pub user: String,
    #[serde(rename = "KeyDir", default = "default_key_dir")]
    pub key_dir: String,
    #[serde(rename = "SshPort", default = "default_ssh_port")]
    pub ssh_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PingConfig {
    /// Milliseconds between echo requests of one reachability test.
    #[serde(rename = "Interval", default = "default_ping_interval")]
    pub interval: u64,
    #[serde(rename = "Count", default = "default_ping_count")]
    pub count: u32,
    /// Milliseconds before a single echo request is given up on.
    #[serde(rename = "Timeout", default = "default_ping_timeout")]
    pub timeout: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_net: default_interval_net(),
            interval_dev: default_interval_dev(),
            workers: default_scan_workers(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            live_timeout: default_live_timeout(),
            interval_updates: default_interval_updates(),
            user: default_ssh_user(),
            key_dir: default_key_dir(),
            ssh_port: default_ssh_port(),
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: default_ping_interval(),
            count: default_ping_count(),
            timeout: default_ping_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось записать файл конфигурации {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать TOML в {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    /// Loads the configuration file, writing the default file first if the
    /// path does not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();

        if !path_ref.exists() {
            fs::write(path_ref, Self::example_toml()).map_err(|source| ConfigError::Write {
                path: path_display.clone(),
                source,
            })?;
        }

        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.pool_size < 1 {
            return Err(ConfigError::Validation(
                "Global.PoolSize должно быть >= 1".to_string(),
            ));
        }
        match self.global.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "Global.LogLevel {other:?} не является уровнем логирования"
                )));
            }
        }
        if self.web.port == 0 {
            return Err(ConfigError::Validation(
                "Web.Port должен быть в диапазоне 1..65535".to_string(),
            ));
        }
        if self.scanner.interval_net < 1 || self.scanner.interval_dev < 1 {
            return Err(ConfigError::Validation(
                "Scanner.IntervalNet и Scanner.IntervalDev должны быть >= 1".to_string(),
            ));
        }
        if self.scanner.workers < 1 {
            return Err(ConfigError::Validation(
                "Scanner.Workers должно быть >= 1".to_string(),
            ));
        }
        if self.device.interval_updates < 1 {
            return Err(ConfigError::Validation(
                "Device.IntervalUpdates должно быть >= 1".to_string(),
            ));
        }
        if self.device.user.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Device.User не должен быть пустым".to_string(),
            ));
        }
        if self.device.ssh_port == 0 {
            return Err(ConfigError::Validation(
                "Device.SshPort должен быть в диапазоне 1..65535".to_string(),
            ));
        }
        if self.ping.count < 1 {
            return Err(ConfigError::Validation(
                "Ping.Count должно быть >= 1".to_string(),
            ));
        }
        if self.ping.timeout == 0 {
            return Err(ConfigError::Validation(
                "Ping.Timeout должно быть > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn interval_net(&self) -> Duration {
        Duration::from_secs(self.scanner.interval_net)
    }

    pub fn interval_dev(&self) -> Duration {
        Duration::from_secs(self.scanner.interval_dev)
    }

    pub fn interval_updates(&self) -> Duration {
        Duration::from_secs(self.device.interval_updates)
    }

    pub fn live_timeout(&self) -> Duration {
        Duration::from_secs(self.device.live_timeout)
    }

    pub fn example_toml() -> &'static str {
        include_str!("../fleetmond.toml.example")
    }
}

const fn default_pool_size() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_web_port() -> u16 {
    3819
}

const fn default_interval_net() -> u64 {
    300
}

const fn default_interval_dev() -> u64 {
    60
}

const fn default_scan_workers() -> usize {
    32
}

const fn default_live_timeout() -> u64 {
    300
}

const fn default_interval_updates() -> u64 {
    3600
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_key_dir() -> String {
    "/etc/fleetmond/keys".to_string()
}

const fn default_ssh_port() -> u16 {
    22
}

const fn default_ping_interval() -> u64 {
    250
}

const fn default_ping_count() -> u32 {
    3
}

const fn default_ping_timeout() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_and_validates() {
        let cfg: Config = toml::from_str(Config::example_toml()).expect("разбор TOML");
        cfg.validate().expect("валидация конфигурации");
        assert_eq!(cfg.web.port, 3819);
        assert_eq!(cfg.scanner.workers, 32);
        assert_eq!(cfg.ping.count, 3);
    }

    #[test]
    fn default_file_written_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetmond.toml");

        let cfg = Config::load_or_create(&path).expect("создание конфигурации по умолчанию");
        assert!(path.exists());
        assert_eq!(cfg.global.pool_size, 4);

        // A second load must read the same file, not rewrite it.
        let before = fs::read_to_string(&path).unwrap();
        let _ = Config::load_or_create(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("[Global]\nDebug = true\n").unwrap();
        cfg.validate().unwrap();
        assert!(cfg.global.debug);
        assert_eq!(cfg.scanner.interval_net, 300);
        assert_eq!(cfg.device.ssh_port, 22);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg: Config = toml::from_str(Config::example_toml()).unwrap();
        cfg.global.pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str(Config::example_toml()).unwrap();
        cfg.global.log_level = "loud".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str(Config::example_toml()).unwrap();
        cfg.device.user = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str(Config::example_toml()).unwrap();
        cfg.ping.count = 0;
        assert!(cfg.validate().is_err());
    }
}
