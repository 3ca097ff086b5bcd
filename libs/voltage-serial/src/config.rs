//! Configuration for the serial polling engine
//!
//! Settings are plain serde structs. Every `#[serde(default = ...)]` function
//! returns the same value as the matching `Default` impl, so a partially
//! written file and `Default::default()` agree.

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SerialError};
use crate::port::{MockPort, Port, SerialPort, SerialPortSettings, TcpPort, TcpPortSettings};
use crate::register::{
    RegisterAddress, RegisterConfig, RegisterFormat, RegisterType, WordOrder,
};

/// Environment variable prefix for overrides, e.g. `VOLTAGE_SERIAL_CLIENT__MAX_POLL_TIME_MS`
pub const ENV_PREFIX: &str = "VOLTAGE_SERIAL_";

// ============================================================================
// Default Value Functions
// ============================================================================

fn default_max_fail_time_ms() -> i64 {
    5000
}

fn default_connection_max_fail_cycles() -> i32 {
    2
}

fn default_reopen_timeout_ms() -> u64 {
    5000
}

fn default_protocol() -> String {
    "modbus".to_string()
}

fn default_slave_id() -> u8 {
    1
}

fn default_frame_timeout_ms() -> u64 {
    20
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_device_timeout_ms() -> i64 {
    3000
}

fn default_device_max_fail_cycles() -> i32 {
    2
}

fn default_max_write_fail_time_s() -> u64 {
    600
}

fn default_scale() -> f64 {
    1.0
}

fn default_max_low_priority_lag_ms() -> u64 {
    1000
}

fn default_max_poll_time_ms() -> u64 {
    100
}

fn default_max_flushes_when_poll_is_due() -> usize {
    20
}

fn default_closed_port_cycle_time_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file_prefix() -> String {
    "voltage-serial".to_string()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Port open/close policy
// ============================================================================

/// Backoff policy of the shared port, a negative value disables auto-close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOpenCloseSettings {
    #[serde(default = "default_max_fail_time_ms")]
    pub max_fail_time_ms: i64,
    #[serde(default = "default_connection_max_fail_cycles")]
    pub connection_max_fail_cycles: i32,
    #[serde(default = "default_reopen_timeout_ms")]
    pub reopen_timeout_ms: u64,
}

impl Default for PortOpenCloseSettings {
    fn default() -> Self {
        Self {
            max_fail_time_ms: default_max_fail_time_ms(),
            connection_max_fail_cycles: default_connection_max_fail_cycles(),
            reopen_timeout_ms: default_reopen_timeout_ms(),
        }
    }
}

impl PortOpenCloseSettings {
    pub fn reopen_timeout(&self) -> Duration {
        Duration::from_millis(self.reopen_timeout_ms)
    }
}

// ============================================================================
// Registers
// ============================================================================

/// Register description as written in a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSettings {
    pub reg_type: RegisterType,
    pub address: RegisterAddress,
    #[serde(default)]
    pub format: RegisterFormat,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub round_to: f64,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default)]
    pub bit_offset: u8,
    #[serde(default)]
    pub bit_width: u8,
    /// Fixed poll period, makes the register high priority
    #[serde(default)]
    pub read_period_ms: Option<u64>,
    #[serde(default)]
    pub read_rate_limit_ms: Option<u64>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub unsupported_value: Option<u64>,
    #[serde(default)]
    pub error_value: Option<u64>,
}

impl RegisterSettings {
    pub fn new(reg_type: RegisterType, address: u32) -> Self {
        Self {
            reg_type,
            address: RegisterAddress::Numeric(address),
            format: RegisterFormat::default(),
            scale: default_scale(),
            offset: 0.0,
            round_to: 0.0,
            word_order: WordOrder::default(),
            bit_offset: 0,
            bit_width: 0,
            read_period_ms: None,
            read_rate_limit_ms: None,
            read_only: false,
            unsupported_value: None,
            error_value: None,
        }
    }

    pub fn to_register_config(&self) -> Result<RegisterConfig> {
        let mut builder = RegisterConfig::builder(self.reg_type, self.address.clone())
            .format(self.format)
            .scale(self.scale)
            .offset(self.offset)
            .round_to(self.round_to)
            .word_order(self.word_order)
            .bits(self.bit_offset, self.bit_width)
            .read_only(self.read_only);
        if let Some(ms) = self.read_period_ms {
            builder = builder.read_period(Duration::from_millis(ms));
        }
        if let Some(ms) = self.read_rate_limit_ms {
            builder = builder.read_rate_limit(Duration::from_millis(ms));
        }
        if let Some(raw) = self.unsupported_value {
            builder = builder.unsupported_value(raw);
        }
        if let Some(raw) = self.error_value {
            builder = builder.error_value(raw);
        }
        builder.build()
    }
}

/// Register written once at the start of every device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupItemConfig {
    pub name: String,
    pub reg_type: RegisterType,
    pub address: u32,
    #[serde(default)]
    pub format: RegisterFormat,
    /// Text value, converted with the register format
    pub value: String,
}

impl SetupItemConfig {
    pub fn to_register_config(&self) -> Result<RegisterConfig> {
        RegisterConfig::builder(self.reg_type, RegisterAddress::Numeric(self.address))
            .format(self.format)
            .build()
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Per-device settings; negative fail budgets disable disconnect detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Unset means 500 ms, left out of poll time estimates
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
    /// Minimal silence before each request
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default = "default_device_timeout_ms")]
    pub device_timeout_ms: i64,
    #[serde(default = "default_device_max_fail_cycles")]
    pub device_max_fail_cycles: i32,
    #[serde(default)]
    pub max_reg_hole: u16,
    #[serde(default)]
    pub max_bit_hole: u16,
    /// 0 means the protocol maximum
    #[serde(default)]
    pub max_read_registers: u16,
    #[serde(default = "default_max_write_fail_time_s")]
    pub max_write_fail_time_s: u64,
    /// RTU: always wait for the frame timeout after the last byte
    #[serde(default)]
    pub force_frame_timeout: bool,
    #[serde(default)]
    pub setup: Vec<SetupItemConfig>,
    #[serde(default)]
    pub registers: Vec<RegisterSettings>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: default_protocol(),
            slave_id: default_slave_id(),
            frame_timeout_ms: default_frame_timeout_ms(),
            response_timeout_ms: None,
            request_delay_ms: 0,
            device_timeout_ms: default_device_timeout_ms(),
            device_max_fail_cycles: default_device_max_fail_cycles(),
            max_reg_hole: 0,
            max_bit_hole: 0,
            max_read_registers: 0,
            max_write_fail_time_s: default_max_write_fail_time_s(),
            force_frame_timeout: false,
            setup: Vec::new(),
            registers: Vec::new(),
        }
    }
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, slave_id: u8) -> Self {
        Self {
            name: name.into(),
            slave_id,
            ..Self::default()
        }
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(
            self.response_timeout_ms
                .unwrap_or_else(default_response_timeout_ms),
        )
    }

    /// Response timeout set explicitly in the configuration
    pub fn configured_response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn max_write_fail_time(&self) -> Duration {
        Duration::from_secs(self.max_write_fail_time_s)
    }

    fn validate(&self) -> Result<()> {
        if self.response_timeout_ms == Some(0) {
            return Err(SerialError::config(format!(
                "device '{}': response_timeout_ms must not be zero",
                self.name
            )));
        }
        if self.frame_timeout_ms == 0 {
            return Err(SerialError::config(format!(
                "device '{}': frame_timeout_ms must not be zero",
                self.name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// High priority debt after which low priority registers get a turn
    #[serde(default = "default_max_low_priority_lag_ms")]
    pub max_low_priority_lag_ms: u64,
    /// Low priority registers per second, 0 disables the limit
    #[serde(default)]
    pub read_rate_limit: u32,
    #[serde(default = "default_max_poll_time_ms")]
    pub max_poll_time_ms: u64,
    #[serde(default = "default_max_flushes_when_poll_is_due")]
    pub max_flushes_when_poll_is_due: usize,
    #[serde(default = "default_closed_port_cycle_time_ms")]
    pub closed_port_cycle_time_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_low_priority_lag_ms: default_max_low_priority_lag_ms(),
            read_rate_limit: 0,
            max_poll_time_ms: default_max_poll_time_ms(),
            max_flushes_when_poll_is_due: default_max_flushes_when_poll_is_due(),
            closed_port_cycle_time_ms: default_closed_port_cycle_time_ms(),
        }
    }
}

impl ClientSettings {
    pub fn max_low_priority_lag(&self) -> Duration {
        Duration::from_millis(self.max_low_priority_lag_ms)
    }

    pub fn max_poll_time(&self) -> Duration {
        Duration::from_millis(self.max_poll_time_ms)
    }

    pub fn closed_port_cycle_time(&self) -> Duration {
        Duration::from_millis(self.closed_port_cycle_time_ms)
    }
}

// ============================================================================
// Port
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PortConfig {
    Serial(SerialPortSettings),
    Tcp(TcpPortSettings),
    /// In-memory port without a peer
    Mock,
}

impl PortConfig {
    pub fn create_port(&self) -> Box<dyn Port> {
        match self {
            PortConfig::Serial(settings) => Box::new(SerialPort::new(settings.clone())),
            PortConfig::Tcp(settings) => Box::new(TcpPort::new(settings.clone())),
            PortConfig::Mock => Box::new(MockPort::new()),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console: bool,
    /// Directory for daily rolling files, none disables file output
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: default_true(),
            log_dir: None,
            file_prefix: default_log_file_prefix(),
        }
    }
}

// ============================================================================
// Top level
// ============================================================================

/// One port with the devices sharing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialServiceConfig {
    pub port: PortConfig,
    #[serde(default)]
    pub port_open_close: PortOpenCloseSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub logging: LogConfig,
}

impl SerialServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(SerialError::config("no devices configured"));
        }
        let mut slaves = HashSet::new();
        for device in &self.devices {
            device.validate()?;
            if !slaves.insert((device.protocol.as_str(), device.slave_id)) {
                return Err(SerialError::config(format!(
                    "duplicate slave id {} for protocol {}",
                    device.slave_id, device.protocol
                )));
            }
        }
        if self.client.max_poll_time_ms == 0 {
            return Err(SerialError::config("max_poll_time_ms must not be zero"));
        }
        Ok(())
    }
}

/// Load and validate configuration from a yaml, toml or json file.
///
/// Environment variables prefixed with [`ENV_PREFIX`] override file values;
/// nested keys are separated by `__`.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> Result<SerialServiceConfig> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| SerialError::config("Config file must have an extension"))?;

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        _ => {
            return Err(SerialError::config(format!(
                "Unsupported config file format: {}",
                extension
            )))
        },
    };

    let config: SerialServiceConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // unwrap() is acceptable in tests
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_match_serde() {
        let device: DeviceConfig = Figment::new()
            .merge(Yaml::string("name: meter"))
            .extract()
            .unwrap();
        assert_eq!(device, DeviceConfig::new("meter", 1));

        let client: ClientSettings = Figment::new().merge(Yaml::string("{}")).extract().unwrap();
        assert_eq!(client, ClientSettings::default());
        assert_eq!(client.max_poll_time(), Duration::from_millis(100));

        let policy: PortOpenCloseSettings =
            Figment::new().merge(Yaml::string("{}")).extract().unwrap();
        assert_eq!(policy.max_fail_time_ms, 5000);
        assert_eq!(policy.connection_max_fail_cycles, 2);
        assert_eq!(policy.reopen_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_yaml() {
        let file = write_file(
            ".yaml",
            r#"
port:
  type: serial
  device: /dev/ttyUSB0
  baud_rate: 19200
client:
  read_rate_limit: 10
devices:
  - name: meter
    slave_id: 3
    max_reg_hole: 2
    setup:
      - name: mode
        reg_type: holding
        address: 100
        value: "1"
    registers:
      - reg_type: holding
        address: 10
        format: s32
        scale: 0.1
        read_period_ms: 1000
"#,
        );
        let config = load_config_from_file(file.path()).unwrap();
        match &config.port {
            PortConfig::Serial(settings) => assert_eq!(settings.baud_rate, 19200),
            other => panic!("unexpected port {other:?}"),
        }
        assert_eq!(config.client.read_rate_limit, 10);
        let device = &config.devices[0];
        assert_eq!(device.slave_id, 3);
        assert_eq!(device.max_reg_hole, 2);
        assert_eq!(device.setup[0].address, 100);

        let register = device.registers[0].to_register_config().unwrap();
        assert_eq!(register.format, RegisterFormat::S32);
        assert_eq!(register.read_period, Some(Duration::from_secs(1)));
        assert!(register.is_high_priority());
    }

    #[test]
    fn test_load_toml() {
        let file = write_file(
            ".toml",
            r#"
[port]
type = "tcp"
address = "127.0.0.1"
port = 502

[[devices]]
name = "inverter"
protocol = "modbus_tcp"
"#,
        );
        let config = load_config_from_file(file.path()).unwrap();
        assert!(matches!(config.port, PortConfig::Tcp(_)));
        assert_eq!(config.devices[0].protocol, "modbus_tcp");
    }

    #[test]
    fn test_validation() {
        let file = write_file(".yaml", "port:\n  type: mock\n");
        let err = load_config_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("no devices configured"));

        let mut config = SerialServiceConfig {
            port: PortConfig::Mock,
            port_open_close: PortOpenCloseSettings::default(),
            client: ClientSettings::default(),
            devices: vec![DeviceConfig::new("a", 1), DeviceConfig::new("b", 1)],
            logging: LogConfig::default(),
        };
        assert!(config.validate().is_err());

        config.devices[1].slave_id = 2;
        assert!(config.validate().is_ok());

        config.devices[1].response_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(load_config_from_file("config.ini").is_err());
    }
}
