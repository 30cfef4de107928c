use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("No config found, tried {0}")]
    NotFound(String),
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

fn serial_port_default() -> String { return "/dev/ttyUSB0".to_string() }
fn serial_baud_rate_default() -> u32 { return 9600 }
fn serial_parity_default() -> ParityConfig { return ParityConfig::Even }
fn serial_data_bits_default() -> u8 { return 8 }
fn serial_stop_bits_default() -> u8 { return 1 }
fn serial_timeout_ms_default() -> u64 { return 1000 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SerialConfig {
    #[serde(default="serial_port_default")]
    pub port: String,
    #[serde(default="serial_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="serial_parity_default")]
    pub parity: ParityConfig,
    #[serde(default="serial_data_bits_default")]
    pub data_bits: u8,
    #[serde(default="serial_stop_bits_default")]
    pub stop_bits: u8,
    /// Response timeout of a single bus transaction
    #[serde(default="serial_timeout_ms_default")]
    pub timeout_ms: u64,
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        return Duration::from_millis(self.timeout_ms);
    }
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "meter2mqtt".to_string() }
fn mqtt_keep_alive_default() -> u64 { return 60 }
fn mqtt_ack_timeout_default() -> u64 { return 10 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    pub topic: String,
    #[serde(default="mqtt_keep_alive_default")]
    pub keep_alive_secs: u64,
    /// How long a publish waits for the broker's PUBACK
    #[serde(default="mqtt_ack_timeout_default")]
    pub ack_timeout_secs: u64,
}

fn register_current_default() -> u16 { return 3009 }
fn register_voltage_default() -> u16 { return 3027 }
fn register_power_factor_default() -> u16 { return 3083 }
fn register_energy_default() -> u16 { return 2699 }

/// Start addresses of the register pairs holding each quantity.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct RegisterConfig {
    #[serde(default="register_current_default")]
    pub current: u16,
    #[serde(default="register_voltage_default")]
    pub voltage: u16,
    #[serde(default="register_power_factor_default")]
    pub power_factor: u16,
    #[serde(default="register_energy_default")]
    pub energy: u16,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        return RegisterConfig {
            current: register_current_default(),
            voltage: register_voltage_default(),
            power_factor: register_power_factor_default(),
            energy: register_energy_default(),
        };
    }
}

fn timing_retry_count_default() -> u32 { return 3 }
fn timing_read_delay_ms_default() -> u64 { return 300 }
fn timing_poll_interval_secs_default() -> u64 { return 300 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TimingConfig {
    /// Total attempts per register read, not additional retries
    #[serde(default="timing_retry_count_default")]
    pub retry_count: u32,
    /// Pause between attempts and between the reads of one meter
    #[serde(default="timing_read_delay_ms_default")]
    pub read_delay_ms: u64,
    #[serde(default="timing_poll_interval_secs_default")]
    pub poll_interval_secs: u64,
}

impl TimingConfig {
    pub fn read_delay(&self) -> Duration {
        return Duration::from_millis(self.read_delay_ms);
    }

    pub fn poll_interval(&self) -> Duration {
        return Duration::from_secs(self.poll_interval_secs);
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        return TimingConfig {
            retry_count: timing_retry_count_default(),
            read_delay_ms: timing_read_delay_ms_default(),
            poll_interval_secs: timing_poll_interval_secs_default(),
        };
    }
}

fn heartbeat_path_default() -> PathBuf { return PathBuf::from("/tmp/last_publish_time") }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HeartbeatConfig {
    #[serde(default="heartbeat_path_default")]
    pub path: PathBuf,
}

fn serial_default() -> SerialConfig {
    return SerialConfig {
        port: serial_port_default(),
        baud_rate: serial_baud_rate_default(),
        parity: serial_parity_default(),
        data_bits: serial_data_bits_default(),
        stop_bits: serial_stop_bits_default(),
        timeout_ms: serial_timeout_ms_default(),
    };
}
fn meters_default() -> Vec<u8> { return vec![1] }
fn heartbeat_default() -> HeartbeatConfig { return HeartbeatConfig { path: heartbeat_path_default() } }

/// Calibration constants of the installed meters. They have no known
/// derivation and are kept as given.
pub fn pf_correction_default() -> BTreeMap<u8, f64> {
    return BTreeMap::from([
        (1, 0.85),
        (4, 0.84),
        (6, 0.50),
        (8, 0.50),
        (9, 0.50),
        (12, 0.50),
        (14, 0.50),
        (16, 0.50),
        (18, 0.50),
    ]);
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="serial_default")]
    pub serial: SerialConfig,
    pub mqtt: MqttConfig,
    /// Modbus slave ids, polled in this order every cycle
    #[serde(default="meters_default")]
    pub meters: Vec<u8>,
    #[serde(default="pf_correction_default")]
    pub pf_correction: BTreeMap<u8, f64>,
    #[serde(default)]
    pub registers: RegisterConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default="heartbeat_default")]
    pub heartbeat: HeartbeatConfig,
}

const CONFIG_PATHS: [&str; 2] = ["config/meter2mqtt.yaml", "meter2mqtt.yaml"];

impl Config {
    /// Loads the config from `$M2M_CONFIG` or the first of the default paths that exists.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("M2M_CONFIG") {
            return Config::load_from(Path::new(&path));
        }

        for path in CONFIG_PATHS {
            let path = Path::new(path);
            if path.exists() {
                return Config::load_from(path);
            }
            debug!("No config at {}", path.display());
        }

        return Err(ConfigError::NotFound(CONFIG_PATHS.join(", ")));
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let io_err = |source| ConfigError::Io { path: path.display().to_string(), source };

        let mut file = File::open(path).map_err(io_err)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(io_err)?;

        let config = Config::from_yaml(&contents)?;
        info!("Loaded config from {} with {} meters", path.display(), config.meters.len());
        return Ok(config);
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        return Ok(config);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.meters.is_empty() {
            return Err(ConfigError::Invalid("at least one meter id is required".to_string()));
        }

        let mut seen = HashSet::new();
        for id in self.meters.iter() {
            if *id == 0 || *id > 247 {
                return Err(ConfigError::Invalid(format!("meter id {id} is not a valid Modbus slave address")));
            }
            if !seen.insert(*id) {
                return Err(ConfigError::Invalid(format!("meter id {id} is configured twice")));
            }
        }

        for (id, factor) in self.pf_correction.iter() {
            if !factor.is_finite() || *factor <= 0.0 || *factor > 1.0 {
                return Err(ConfigError::Invalid(format!("power factor correction {factor} of meter {id} is outside (0, 1]")));
            }
        }

        if self.timing.retry_count == 0 {
            return Err(ConfigError::Invalid("timing.retry_count must be at least 1".to_string()));
        }

        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic must not be empty".to_string()));
        }

        if !matches!(self.serial.data_bits, 5..=8) {
            return Err(ConfigError::Invalid(format!("serial.data_bits {} is not supported", self.serial.data_bits)));
        }

        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(ConfigError::Invalid(format!("serial.stop_bits {} is not supported", self.serial.stop_bits)));
        }

        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r"
mqtt:
  host: broker.local
  topic: smart-meter/site
";

    #[test]
    fn test_defaults_match_deployment() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.parity, ParityConfig::Even);
        assert_eq!(config.serial.timeout(), Duration::from_secs(1));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.meters, vec![1]);
        assert_eq!(config.registers, RegisterConfig::default());
        assert_eq!(config.registers.energy, 2699);
        assert_eq!(config.timing.retry_count, 3);
        assert_eq!(config.timing.read_delay(), Duration::from_millis(300));
        assert_eq!(config.timing.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.heartbeat.path, PathBuf::from("/tmp/last_publish_time"));
        assert_eq!(config.pf_correction.get(&6), Some(&0.5));
        assert_eq!(config.pf_correction.get(&1), Some(&0.85));
    }

    #[test]
    fn test_full_config() {
        let yaml = r"
serial:
  port: /dev/ttyAMA0
  baud_rate: 19200
  parity: None
mqtt:
  host: broker.local
  user: meter
  pass: secret
  topic: smart-meter/site
meters: [4, 2, 9]
pf_correction:
  4: 0.84
registers:
  current: 100
timing:
  poll_interval_secs: 60
heartbeat:
  path: /var/run/m2m_heartbeat
";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.serial.baud_rate, 19200);
        assert_eq!(config.serial.parity, ParityConfig::None);
        assert_eq!(config.mqtt.user.as_deref(), Some("meter"));
        assert_eq!(config.meters, vec![4, 2, 9]);
        assert_eq!(config.pf_correction.len(), 1);
        assert_eq!(config.registers.current, 100);
        assert_eq!(config.registers.voltage, 3027);
        assert_eq!(config.timing.poll_interval_secs, 60);
        assert_eq!(config.timing.retry_count, 3);
    }

    #[test]
    fn test_rejects_bad_correction() {
        let yaml = format!("{MINIMAL}pf_correction:\n  3: 1.5\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Invalid(_))));

        let yaml = format!("{MINIMAL}pf_correction:\n  3: 0.0\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_meters() {
        let yaml = format!("{MINIMAL}meters: []\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Invalid(_))));

        let yaml = format!("{MINIMAL}meters: [1, 1]\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_yaml(include_str!("../../config/meter2mqtt.example.yaml")).unwrap();
        assert_eq!(config.pf_correction, pf_correction_default());
        assert_eq!(config.registers, RegisterConfig::default());
    }

    #[test]
    fn test_missing_mqtt_is_parse_error() {
        assert!(matches!(Config::from_yaml("meters: [1]\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.mqtt.topic, "smart-meter/site");

        let missing = Config::load_from(Path::new("/nonexistent/meter2mqtt.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
