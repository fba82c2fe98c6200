//! Configuration loading and validation.
//!
//! The config file is required JSON, loaded the way `comsrv`'s `ConfigManager`
//! loads its channel config: a plain `serde_json::from_reader` over a
//! `std::fs::File`, failing loudly on a missing or malformed file. Unlike
//! `config`-crate layered sources (used by `modsrv`), this service has a
//! single file and no env-var overlay beyond the explicit `*_env` indirection
//! the spec calls for (§6) — so plain serde is the right tool, matching the
//! teacher's simpler services.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SilodError};

fn default_baudrate_timeout() -> f64 {
    1.0
}
fn default_bytesize() -> u8 {
    8
}
fn default_parity() -> String {
    "N".to_string()
}
fn default_stopbits() -> u8 {
    1
}
fn default_interval_seconds() -> f64 {
    30.0
}
fn default_slave_delay_seconds() -> f64 {
    0.1
}
fn default_max_retries() -> u32 {
    3
}
fn default_slaves() -> Vec<u8> {
    (1..=15).collect()
}
fn default_min_value() -> u16 {
    0
}
fn default_max_value() -> u16 {
    28000
}
fn default_db_port() -> u16 {
    1433
}
fn default_table_name() -> String {
    "silo_monitoring".to_string()
}
fn default_write_interval_seconds() -> u64 {
    60
}
fn default_batch_size() -> usize {
    50
}
fn default_http_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_offline_threshold_minutes() -> u64 {
    5
}
fn default_cooldown_minutes() -> u64 {
    15
}
fn default_history_max_points() -> usize {
    100
}
fn default_connection_timeout_seconds() -> f64 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    pub serial_port: String,
    pub baudrate: u32,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default = "default_baudrate_timeout")]
    pub timeout: f64,
    #[serde(default = "default_connection_timeout_seconds")]
    pub connection_timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,
    #[serde(default = "default_slave_delay_seconds")]
    pub slave_delay_seconds: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_slaves")]
    pub slaves: Vec<u8>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            slave_delay_seconds: default_slave_delay_seconds(),
            max_retries: default_max_retries(),
            slaves: default_slaves(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_value")]
    pub min_value: u16,
    #[serde(default = "default_max_value")]
    pub max_value: u16,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_value: default_min_value(),
            max_value: default_max_value(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub username_env: String,
    #[serde(default)]
    pub password_env: String,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default = "default_write_interval_seconds")]
    pub write_interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub max_bytes: Option<u64>,
    #[serde(default)]
    pub backup_count: Option<u32>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_file: None,
            level: default_log_level(),
            max_bytes: None,
            backup_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token_env: String,
    #[serde(default)]
    pub chat_id_env: String,
    #[serde(default = "default_cooldown_minutes")]
    pub alert_cooldown_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_offline_threshold_minutes")]
    pub offline_threshold_minutes: u64,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub flask: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default = "default_history_max_points")]
    pub history_max_points: usize,
}

impl Config {
    /// Load configuration from `path`. Writes an example file and fails if
    /// `path` does not exist, per spec.md §6.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let example = Self::example();
            let body = serde_json::to_string_pretty(&example)
                .map_err(|e| SilodError::Config(format!("failed to render example config: {e}")))?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            fs::write(path, body)?;
            return Err(SilodError::Config(format!(
                "config file {} not found; wrote an example, please edit it and restart",
                path.display()
            )));
        }

        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| SilodError::Config(format!("invalid config file {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.modbus.serial_port.trim().is_empty() {
            return Err(SilodError::Config("modbus.serial_port is required".into()));
        }
        if self.modbus.baudrate == 0 {
            return Err(SilodError::Config("modbus.baudrate must be > 0".into()));
        }
        if ![7u8, 8].contains(&self.modbus.bytesize) {
            return Err(SilodError::Config("modbus.bytesize must be 7 or 8".into()));
        }
        if !["N", "E", "O"].contains(&self.modbus.parity.as_str()) {
            return Err(SilodError::Config("modbus.parity must be N, E, or O".into()));
        }
        if ![1u8, 2].contains(&self.modbus.stopbits) {
            return Err(SilodError::Config("modbus.stopbits must be 1 or 2".into()));
        }
        if self.validation.min_value > self.validation.max_value {
            return Err(SilodError::Config(
                "validation.min_value must be <= validation.max_value".into(),
            ));
        }
        for slave in &self.polling.slaves {
            if *slave == 0 || *slave > 247 {
                return Err(SilodError::Config(
                    "polling.slaves entries must be in [1, 247]".into(),
                ));
            }
        }
        if self.database.enabled && self.database.host.trim().is_empty() {
            return Err(SilodError::Config(
                "database.host is required when database.enabled is true".into(),
            ));
        }
        if self.alerts.enabled
            && (self.alerts.telegram.bot_token_env.is_empty()
                || self.alerts.telegram.chat_id_env.is_empty())
        {
            return Err(SilodError::Config(
                "alerts.telegram.bot_token_env and chat_id_env are required when alerts.enabled is true"
                    .into(),
            ));
        }
        Ok(())
    }

    fn example() -> Self {
        Config {
            modbus: ModbusConfig {
                serial_port: "/dev/ttyUSB0".to_string(),
                baudrate: 9600,
                bytesize: default_bytesize(),
                parity: default_parity(),
                stopbits: default_stopbits(),
                timeout: default_baudrate_timeout(),
                connection_timeout: default_connection_timeout_seconds(),
            },
            polling: PollingConfig::default(),
            validation: ValidationConfig::default(),
            database: DatabaseConfig {
                enabled: false,
                host: "sql.example.local".to_string(),
                port: default_db_port(),
                database: "ERP".to_string(),
                instance: None,
                username_env: "SILO_DB_USER".to_string(),
                password_env: "SILO_DB_PASSWORD".to_string(),
                table_name: default_table_name(),
                driver: "tiberius".to_string(),
                write_interval_seconds: default_write_interval_seconds(),
                batch_size: default_batch_size(),
            },
            flask: HttpConfig::default(),
            logging: LoggingConfig {
                log_dir: Some("logs".to_string()),
                log_file: Some("silod.log".to_string()),
                level: default_log_level(),
                max_bytes: Some(10_485_760),
                backup_count: Some(5),
            },
            alerts: AlertsConfig {
                enabled: false,
                offline_threshold_minutes: default_offline_threshold_minutes(),
                telegram: TelegramConfig {
                    bot_token_env: "SILO_TELEGRAM_BOT_TOKEN".to_string(),
                    chat_id_env: "SILO_TELEGRAM_CHAT_ID".to_string(),
                    alert_cooldown_minutes: default_cooldown_minutes(),
                },
            },
            history_max_points: default_history_max_points(),
        }
    }

    /// External ERP code for a slave address: `"S" + zero-padded two digits`.
    pub fn external_code(slave: u8) -> String {
        format!("S{slave:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_config_writes_example_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        let err = Config::load(&path).unwrap_err();
        assert!(path.exists());
        assert!(matches!(err, SilodError::Config(_)));
    }

    #[test]
    fn valid_config_loads() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"modbus": {{"serial_port": "/dev/ttyUSB0", "baudrate": 9600}}}}"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.polling.slaves, (1..=15).collect::<Vec<_>>());
        assert_eq!(config.validation.max_value, 28000);
    }

    #[test]
    fn rejects_bad_parity() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"modbus": {{"serial_port": "/dev/ttyUSB0", "baudrate": 9600, "parity": "X"}}}}"#
        )
        .unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, SilodError::Config(_)));
    }

    #[test]
    fn rejects_slave_address_above_247() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"modbus": {{"serial_port": "/dev/ttyUSB0", "baudrate": 9600}}, "polling": {{"slaves": [1, 248]}}}}"#
        )
        .unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, SilodError::Config(_)));
    }

    #[test]
    fn external_code_zero_pads() {
        assert_eq!(Config::external_code(1), "S01");
        assert_eq!(Config::external_code(15), "S15");
    }
}
