use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{MeterConfig, MeterModel, MAX_METER_ADDRESS, MIN_METER_ADDRESS};

pub const CONFIG_ENV: &str = "SDM2MQTT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("no config found, tried {0}")]
    NotFound(String),
    #[error("meter address {0} is outside of {min}-{max}", min = MIN_METER_ADDRESS, max = MAX_METER_ADDRESS)]
    InvalidAddress(u16),
    #[error("meter address {0} is configured more than once")]
    DuplicateAddress(u8),
    #[error("unknown meter model '{0}', supported are SDM120, SDM220, SDM230 and SDM630")]
    UnknownModel(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Parity {
    N,
    E,
    O,
}

fn serial_port_default() -> String { return "/dev/ttyUSB0".to_string() }
fn serial_baudrate_default() -> u32 { return 9600 }
fn serial_parity_default() -> Parity { return Parity::N }
fn serial_stopbits_default() -> u8 { return 1 }
fn serial_bytesize_default() -> u8 { return 8 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SerialConfig {
    #[serde(default="serial_port_default")]
    pub port: String,
    #[serde(default="serial_baudrate_default")]
    pub baudrate: u32,
    #[serde(default="serial_parity_default")]
    pub parity: Parity,
    #[serde(default="serial_stopbits_default")]
    pub stopbits: u8,
    #[serde(default="serial_bytesize_default")]
    pub bytesize: u8,
}

fn mqtt_enabled_default() -> bool { return true }
fn mqtt_host_default() -> String { return "localhost".to_string() }
fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "sdm2mqtt".to_string() }
fn mqtt_topic_prefix_default() -> String { return "home/energy/sdm".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttConfig {
    #[serde(default="mqtt_enabled_default")]
    pub enabled: bool,
    #[serde(default="mqtt_host_default")]
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    #[serde(default="mqtt_topic_prefix_default")]
    pub topic_prefix: String,
}

fn httpd_enabled_default() -> bool { return true }
fn httpd_port_default() -> u16 { return 8000 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct HttpdConfig {
    #[serde(default="httpd_enabled_default")]
    pub enabled: bool,
    #[serde(default="httpd_port_default")]
    pub port: u16
}

fn polling_interval_default() -> u64 { return 10 }
fn polling_request_timeout_default() -> u64 { return 1000 }
fn polling_inter_request_delay_default() -> u64 { return 50 }
fn polling_inter_meter_delay_default() -> u64 { return 500 }
fn polling_silent_probe_limit_default() -> u32 { return 3 }
fn polling_unreachable_after_default() -> u32 { return 5 }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PollingConfig {
    /// Seconds between the start of two poll cycles
    #[serde(default="polling_interval_default")]
    pub interval: u64,
    #[serde(default="polling_request_timeout_default")]
    pub request_timeout_ms: u64,
    #[serde(default="polling_inter_request_delay_default")]
    pub inter_request_delay_ms: u64,
    /// Pause between two meters of the same cycle, the bus is free meanwhile
    #[serde(default="polling_inter_meter_delay_default")]
    pub inter_meter_delay_ms: u64,
    #[serde(default="polling_silent_probe_limit_default")]
    pub silent_probe_limit: u32,
    /// Consecutive failed cycles before a meter is reported unreachable, 0 disables
    #[serde(default="polling_unreachable_after_default")]
    pub unreachable_after: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterEntryConfig {
    pub model: String,
    pub address: u16,
    #[serde(default)]
    pub name: Option<String>,
}

fn serial_default() -> SerialConfig {
    return SerialConfig {
        port: serial_port_default(),
        baudrate: serial_baudrate_default(),
        parity: serial_parity_default(),
        stopbits: serial_stopbits_default(),
        bytesize: serial_bytesize_default(),
    }
}
fn mqtt_default() -> MqttConfig {
    return MqttConfig {
        enabled: mqtt_enabled_default(),
        host: mqtt_host_default(),
        port: mqtt_port_default(),
        user: None,
        pass: None,
        client_name: mqtt_client_name_default(),
        topic_prefix: mqtt_topic_prefix_default(),
    }
}
fn httpd_default() -> HttpdConfig { return HttpdConfig { enabled: httpd_enabled_default(), port: httpd_port_default() } }
fn polling_default() -> PollingConfig {
    return PollingConfig {
        interval: polling_interval_default(),
        request_timeout_ms: polling_request_timeout_default(),
        inter_request_delay_ms: polling_inter_request_delay_default(),
        inter_meter_delay_ms: polling_inter_meter_delay_default(),
        silent_probe_limit: polling_silent_probe_limit_default(),
        unreachable_after: polling_unreachable_after_default(),
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="serial_default")]
    pub serial: SerialConfig,
    #[serde(default="mqtt_default")]
    pub mqtt: MqttConfig,
    #[serde(default="httpd_default")]
    pub httpd: HttpdConfig,
    #[serde(default="polling_default")]
    pub polling: PollingConfig,
    pub meters: Vec<MeterEntryConfig>,
}

impl Config {
    /// Load from `$SDM2MQTT_CONFIG`, `config/sdm2mqtt.yaml` or `sdm2mqtt.yaml`, first hit wins
    pub fn load() -> Result<Self, ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("config/sdm2mqtt.yaml"));
        candidates.push(PathBuf::from("sdm2mqtt.yaml"));

        for path in candidates.iter() {
            if path.is_file() {
                info!("Loading configuration from {}", path.display());
                return Config::from_file(path);
            }
            debug!("No config at {}", path.display());
        }

        let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        return Err(ConfigError::NotFound(tried.join(", ")));
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        return Config::parse(&contents);
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        return Ok(c);
    }

    /// Check everything that would otherwise blow up at runtime and build the meter set.
    ///
    /// Meters keep the order of the file, that is the order they are polled in.
    pub fn validate(&self) -> Result<Vec<MeterConfig>, ConfigError> {
        if ![1, 2].contains(&self.serial.stopbits) {
            return Err(ConfigError::Validation(format!("stopbits must be 1 or 2, got {}", self.serial.stopbits)));
        }
        if ![7, 8].contains(&self.serial.bytesize) {
            return Err(ConfigError::Validation(format!("bytesize must be 7 or 8, got {}", self.serial.bytesize)));
        }
        if self.serial.baudrate == 0 {
            return Err(ConfigError::Validation("baudrate must not be 0".to_string()));
        }
        if self.polling.interval == 0 {
            return Err(ConfigError::Validation("poll interval must be at least 1 second".to_string()));
        }
        if self.polling.request_timeout_ms == 0 {
            return Err(ConfigError::Validation("request timeout must not be 0".to_string()));
        }
        if self.mqtt.enabled && self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Validation("MQTT topic prefix must not be empty".to_string()));
        }
        if self.meters.is_empty() {
            return Err(ConfigError::Validation("no meters configured".to_string()));
        }

        let mut seen: HashSet<u8> = HashSet::new();
        let mut meters = Vec::new();
        for entry in self.meters.iter() {
            let model = entry.model.parse::<MeterModel>()
                .map_err(|_| ConfigError::UnknownModel(entry.model.clone()))?;

            if entry.address < MIN_METER_ADDRESS as u16 || entry.address > MAX_METER_ADDRESS as u16 {
                return Err(ConfigError::InvalidAddress(entry.address));
            }
            let address = entry.address as u8;

            if !seen.insert(address) {
                return Err(ConfigError::DuplicateAddress(address));
            }

            meters.push(MeterConfig::new(model, address, entry.name.clone()));
        }

        let mut slugs: HashSet<&str> = HashSet::new();
        for meter in meters.iter() {
            if meter.slug.is_empty() {
                return Err(ConfigError::Validation(format!("meter {} has a name without any letters or digits", meter.address)));
            }
            if !slugs.insert(meter.slug.as_str()) {
                return Err(ConfigError::Validation(format!("more than one meter would publish as '{}'", meter.slug)));
            }
        }

        return Ok(meters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
serial:
  port: /dev/ttyAMA0
  baudrate: 2400
  parity: E
mqtt:
  host: broker.local
  user: admin
  pass: secret
polling:
  interval: 5
meters:
  - model: SDM120
    address: 101
    name: Kitchen
  - model: sdm630
    address: 100
    name: Main Panel
  - model: SDM230
    address: 12
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::parse(EXAMPLE).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyAMA0");
        assert_eq!(config.serial.baudrate, 2400);
        assert_eq!(config.serial.parity, Parity::E);
        assert_eq!(config.serial.stopbits, 1);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "home/energy/sdm");
        assert_eq!(config.mqtt.user.as_deref(), Some("admin"));
        assert_eq!(config.httpd.port, 8000);
        assert_eq!(config.polling.interval, 5);
        assert_eq!(config.polling.request_timeout_ms, 1000);
        assert_eq!(config.polling.inter_meter_delay_ms, 500);
    }

    #[test]
    fn test_validate_keeps_order() {
        let meters = Config::parse(EXAMPLE).unwrap().validate().unwrap();
        assert_eq!(meters.len(), 3);
        assert_eq!(meters[0].slug, "kitchen");
        assert_eq!(meters[1].model, MeterModel::SDM630);
        assert_eq!(meters[1].slug, "main-panel");
        assert_eq!(meters[2].display_name, "SDM230 12");
    }

    fn with_meters(meters: &str) -> Config {
        Config::parse(&format!("meters:\n{}", meters)).unwrap()
    }

    #[test]
    fn test_duplicate_address() {
        let config = with_meters("  - { model: SDM120, address: 5, name: A }\n  - { model: SDM630, address: 5, name: B }\n");
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateAddress(5))));
    }

    #[test]
    fn test_address_out_of_range() {
        let config = with_meters("  - { model: SDM120, address: 248 }\n");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(248))));

        let config = with_meters("  - { model: SDM120, address: 0 }\n");
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(0))));
    }

    #[test]
    fn test_unknown_model() {
        let config = with_meters("  - { model: SDM72, address: 1 }\n");
        assert!(matches!(config.validate(), Err(ConfigError::UnknownModel(m)) if m == "SDM72"));
    }

    #[test]
    fn test_clashing_slugs() {
        let config = with_meters("  - { model: SDM120, address: 1, name: Main Panel }\n  - { model: SDM120, address: 2, name: main-panel }\n");
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_bad_serial_settings() {
        let mut config = with_meters("  - { model: SDM120, address: 1 }\n");
        config.serial.stopbits = 3;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        config.serial.stopbits = 2;
        config.serial.bytesize = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_no_meters() {
        let config = Config::parse("meters: []\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.meters.len(), 3);

        let missing = Config::from_file(Path::new("/nonexistent/sdm2mqtt.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
