use crate::mqtt::MqttConfig;
use anyhow::{ensure, Context, Result};
use pylonbus_lib::limits::Ceilings;
use pylonbus_lib::link::LinkSettings;
use pylonbus_lib::poller::PollSettings;
use pylonbus_lib::protocol::Address;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    /// Pause between two polling cycles.
    #[serde(with = "humantime_serde")]
    pub reading_freq: Duration,
    pub wake_baud: u32,
    pub baud: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub info_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub bat_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let link = LinkSettings::default();
        Self {
            port: default_device_name(),
            reading_freq: Duration::from_secs(2),
            wake_baud: link.wake_baud,
            baud: link.baud,
            timeout: link.timeout,
            info_timeout: Duration::from_secs(10),
            bat_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatteryConfig {
    pub addresses: Vec<Address>,
    pub num_cells: u32,
    pub max_charge_voltage: f64,
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        let ceilings = Ceilings::default();
        Self {
            addresses: (1..=5).collect(),
            num_cells: ceilings.cell_count,
            max_charge_voltage: ceilings.max_charge_voltage,
            max_charge_current: ceilings.max_charge_current,
            max_discharge_current: ceilings.max_discharge_current,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also log into this file when set.
    pub file_path: Option<PathBuf>,
    pub file_max_size_kb: u64,
    pub file_max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file_path: None,
            file_max_size_kb: 1000,
            file_max_files: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub battery: BatteryConfig,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

    pub fn load<P: AsRef<Path>>(config_file_path: P) -> Result<Self> {
        let config_file_path = config_file_path.as_ref();
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Like [`Config::load`], but `None` when the file does not exist.
    /// Unreadable or invalid files are still an error.
    pub fn load_if_exists<P: AsRef<Path>>(config_file_path: P) -> Result<Option<Self>> {
        let config_file_path = config_file_path.as_ref();
        if !config_file_path.exists() {
            return Ok(None);
        }
        Self::load(config_file_path).map(Some)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.battery.addresses.is_empty(),
            "battery.addresses must not be empty"
        );
        ensure!(self.battery.num_cells > 0, "battery.num_cells must not be 0");
        ensure!(
            self.battery.max_charge_voltage > 0.0,
            "battery.max_charge_voltage must be positive"
        );
        ensure!(
            self.battery.max_charge_current > 0.0,
            "battery.max_charge_current must be positive"
        );
        ensure!(
            self.battery.max_discharge_current > 0.0,
            "battery.max_discharge_current must be positive"
        );
        ensure!(
            self.serial.baud > 0 && self.serial.wake_baud > 0,
            "serial baud rates must not be 0"
        );
        self.mqtt.validate()
    }

    pub fn ceilings(&self) -> Ceilings {
        Ceilings {
            max_charge_voltage: self.battery.max_charge_voltage,
            max_charge_current: self.battery.max_charge_current,
            max_discharge_current: self.battery.max_discharge_current,
            cell_count: self.battery.num_cells,
        }
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            wake_baud: self.serial.wake_baud,
            baud: self.serial.baud,
            timeout: self.serial.timeout,
            ..Default::default()
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            addresses: self.battery.addresses.clone(),
            info_timeout: self.serial.info_timeout,
            bat_timeout: self.serial.bat_timeout,
            topic_base: self.mqtt.topic_base.clone(),
        }
    }
}
