//! Line oriented console protocol of the battery bus.
//!
//! Every exchange is a single ASCII command terminated by a newline. The bus
//! answers with free form text lines and finishes with a line containing
//! [`COMMAND_COMPLETED`]. The decoders in this module are tolerant: a line
//! that cannot be understood is logged and skipped, it never aborts the batch.

use std::fmt;

/// Frame sent at the wake baud rate to switch the bus into console mode.
pub const WAKE_FRAME: &[u8] = b"~20014682C0048520FCC3\r";
/// Console login sent after switching to the operating baud rate.
pub const LOGIN: &str = "login debug";
pub const LINE_TERMINATOR: u8 = b'\n';
/// Marker closing every response.
pub const COMMAND_COMPLETED: &str = "Command completed";
/// Header preceding the cell table of a `bat` response.
pub const BATTERY_HEADER: &str = "Battery";

/// Condition that opens collection of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMarker<'a> {
    /// Collect from the very first line.
    Any,
    /// Collect once a line containing the given text has been seen.
    Contains(&'a str),
}

impl StartMarker<'_> {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            StartMarker::Any => true,
            StartMarker::Contains(marker) => line.contains(marker),
        }
    }
}

/// Bus address of a single battery unit.
pub type Address = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Static unit information: ceilings, barcode, cell count.
    Info(Address),
    /// Pack level measurements and event registers.
    Power(Address),
    /// Per cell table.
    Battery(Address),
}

impl Command {
    pub fn address(&self) -> Address {
        match *self {
            Command::Info(address) | Command::Power(address) | Command::Battery(address) => {
                address
            }
        }
    }

    /// Request text without terminator, e.g. `pwr 3`.
    pub fn request(&self) -> String {
        self.to_string()
    }

    /// The console echoes `info`/`pwr` requests, so the echoed `request`
    /// opens the response. The cell table starts at its own header line.
    pub fn start_marker<'a>(&self, request: &'a str) -> StartMarker<'a> {
        match self {
            Command::Battery(_) => StartMarker::Contains(BATTERY_HEADER),
            Command::Info(_) | Command::Power(_) => StartMarker::Contains(request),
        }
    }

    pub fn stop_marker(&self) -> &'static str {
        COMMAND_COMPLETED
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Info(address) => write!(f, "info {address}"),
            Command::Power(address) => write!(f, "pwr {address}"),
            Command::Battery(address) => write!(f, "bat {address}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum LineError {
    #[error("missing value")]
    MissingValue,
    #[error("too few columns ({0})")]
    TooFewColumns(usize),
    #[error("invalid number: {0}")]
    Float(#[from] std::num::ParseFloatError),
    #[error("invalid integer: {0}")]
    Int(#[from] std::num::ParseIntError),
}

/// Splits `Key : value unit` on the first colon and returns the trimmed key
/// with the first whitespace token of the value. `None` for lines without a
/// colon.
fn key_value(line: &str) -> Option<(&str, std::result::Result<&str, LineError>)> {
    let (key, rest) = line.split_once(':')?;
    let value = rest.split_whitespace().next().ok_or(LineError::MissingValue);
    Some((key.trim(), value))
}

fn parse_hex(value: &str) -> std::result::Result<u32, LineError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    Ok(u32::from_str_radix(digits, 16)?)
}

/// Fields of an `info` response, in device units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoReport {
    /// mA
    pub max_charge_current: Option<f64>,
    /// mA, reported negative by some firmware
    pub max_discharge_current: Option<f64>,
    pub barcode: Option<String>,
    pub cell_count: Option<u32>,
}

pub fn decode_info<S: AsRef<str>>(lines: &[S]) -> InfoReport {
    let mut report = InfoReport::default();
    for line in lines {
        let line = line.as_ref();
        let Some((key, value)) = key_value(line) else {
            continue;
        };
        let result = value.and_then(|value| {
            match key {
                "Max Charge Curr" => report.max_charge_current = Some(value.parse()?),
                "Max Dischg Curr" => report.max_discharge_current = Some(value.parse()?),
                "Barcode" => report.barcode = Some(value.to_string()),
                "Cell Count" => report.cell_count = Some(value.parse()?),
                _ => {}
            }
            Ok(())
        });
        match result {
            Ok(()) => log::trace!("info line '{}' -> {key}", line.trim()),
            Err(err) => log::warn!("Error parsing info line '{}': {err}", line.trim()),
        }
    }
    report
}

/// Fields of a `pwr` response, in device units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerReport {
    /// mV
    pub voltage: Option<f64>,
    /// mA, negative while discharging
    pub current: Option<f64>,
    /// m°C
    pub temperature: Option<f64>,
    /// percent
    pub coulomb: Option<u32>,
    /// mAh
    pub total_coulomb: Option<f64>,
    pub heater_on: Option<bool>,
    pub charge_times: Option<u32>,
    pub bat_events: Option<u32>,
    pub power_events: Option<u32>,
    pub system_fault: Option<u32>,
}

pub fn decode_pwr<S: AsRef<str>>(lines: &[S]) -> PowerReport {
    let mut report = PowerReport::default();
    for line in lines {
        let line = line.as_ref();
        let Some((key, value)) = key_value(line) else {
            continue;
        };
        let result = value.and_then(|value| {
            match key {
                "Voltage" => report.voltage = Some(value.parse()?),
                "Current" => report.current = Some(value.parse()?),
                "Temperature" => report.temperature = Some(value.parse()?),
                "Coulomb" => report.coulomb = Some(value.trim_end_matches('%').parse()?),
                "Total Coulomb" => report.total_coulomb = Some(value.parse()?),
                "Heater Status" => report.heater_on = Some(value.eq_ignore_ascii_case("on")),
                "Charge Times" => report.charge_times = Some(value.parse()?),
                "Bat Events" => report.bat_events = Some(parse_hex(value)?),
                "Power Events" => report.power_events = Some(parse_hex(value)?),
                "System Fault" => report.system_fault = Some(parse_hex(value)?),
                _ => {}
            }
            Ok(())
        });
        if let Err(err) = result {
            log::warn!("Error parsing pwr line '{}': {err}", line.trim());
        }
    }
    report
}

/// One row of the `bat` cell table, in device units.
#[derive(Debug, Clone, PartialEq)]
pub struct CellReading {
    /// 1-based cell index
    pub index: u32,
    /// mV
    pub voltage: f64,
    /// m°C
    pub temperature: f64,
    /// percent
    pub soc: u32,
}

impl CellReading {
    /// Key used for this cell in the published `Voltages`/`Balances` maps.
    pub fn key(&self) -> String {
        format!("Cell{}", self.index)
    }
}

const CELL_COLUMNS: usize = 10;

fn decode_cell_line(line: &str) -> std::result::Result<CellReading, LineError> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < CELL_COLUMNS {
        return Err(LineError::TooFewColumns(columns.len()));
    }
    Ok(CellReading {
        index: columns[0].parse::<u32>()? + 1,
        voltage: columns[1].parse()?,
        temperature: columns[3].parse()?,
        soc: columns[8].trim_end_matches('%').parse()?,
    })
}

pub fn decode_bat<S: AsRef<str>>(lines: &[S]) -> Vec<CellReading> {
    let mut cells = Vec::new();
    for line in lines {
        let line = line.as_ref();
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        match decode_cell_line(line) {
            Ok(cell) => {
                log::trace!(
                    "Cell{} volt={}mV temp={}m°C soc={}%",
                    cell.index,
                    cell.voltage,
                    cell.temperature,
                    cell.soc
                );
                cells.push(cell)
            }
            Err(LineError::TooFewColumns(n)) => {
                log::trace!("Skipping cell line with {n} columns: '{}'", line.trim())
            }
            Err(err) => log::warn!("Error parsing cell line '{}': {err}", line.trim()),
        }
    }
    cells
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

macro_rules! read_bit {
    ($register:expr,$position:expr) => {
        ($register >> $position) & 1 != 0
    };
}

/// Bits of the `Power Events` and `Bat Events` registers, in bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Overvoltage,
    HighVoltage,
    VoltageNormal,
    LowVoltage,
    Undervoltage,
    CellSleep,
    BatteryLifeAlarm1,
    SystemStartup,
    OverTemperature,
    HighTemperature,
    TemperatureNormal,
    LowTemperature,
    UnderTemperature,
    FullCharge,
    NormalPower,
    LowPower,
    ShortCircuitProtection,
    DischargeOvercurrent2,
    ChargeOvercurrent2,
    DischargeOvercurrent,
    ChargeOvercurrent,
    SystemIdle,
    Charging,
    Discharging,
    SystemPowerFailure,
    SystemIdleAlarm,
    ChargingAlarm,
    DischargingAlarm,
    SystemError,
    SystemHibernation,
    SystemShutdown,
    BatteryLifeAlarm2,
}

impl PowerEvent {
    const BITS: [PowerEvent; 32] = [
        PowerEvent::Overvoltage,
        PowerEvent::HighVoltage,
        PowerEvent::VoltageNormal,
        PowerEvent::LowVoltage,
        PowerEvent::Undervoltage,
        PowerEvent::CellSleep,
        PowerEvent::BatteryLifeAlarm1,
        PowerEvent::SystemStartup,
        PowerEvent::OverTemperature,
        PowerEvent::HighTemperature,
        PowerEvent::TemperatureNormal,
        PowerEvent::LowTemperature,
        PowerEvent::UnderTemperature,
        PowerEvent::FullCharge,
        PowerEvent::NormalPower,
        PowerEvent::LowPower,
        PowerEvent::ShortCircuitProtection,
        PowerEvent::DischargeOvercurrent2,
        PowerEvent::ChargeOvercurrent2,
        PowerEvent::DischargeOvercurrent,
        PowerEvent::ChargeOvercurrent,
        PowerEvent::SystemIdle,
        PowerEvent::Charging,
        PowerEvent::Discharging,
        PowerEvent::SystemPowerFailure,
        PowerEvent::SystemIdleAlarm,
        PowerEvent::ChargingAlarm,
        PowerEvent::DischargingAlarm,
        PowerEvent::SystemError,
        PowerEvent::SystemHibernation,
        PowerEvent::SystemShutdown,
        PowerEvent::BatteryLifeAlarm2,
    ];

    /// Every event whose bit is set in `register`.
    pub fn decode(register: u32) -> Vec<Self> {
        let mut result = Vec::new();
        for (bit, event) in Self::BITS.iter().enumerate() {
            if read_bit!(register, bit) {
                result.push(*event);
            }
        }
        result
    }

    pub fn severity(&self) -> Severity {
        match self {
            PowerEvent::VoltageNormal
            | PowerEvent::TemperatureNormal
            | PowerEvent::SystemIdle
            | PowerEvent::Charging
            | PowerEvent::Discharging => Severity::Info,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for PowerEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PowerEvent::Overvoltage => write!(f, "Overvoltage alarm"),
            PowerEvent::HighVoltage => write!(f, "High voltage alarm"),
            PowerEvent::VoltageNormal => write!(f, "The voltage is normal"),
            PowerEvent::LowVoltage => write!(f, "Low voltage alarm"),
            PowerEvent::Undervoltage => write!(f, "Under voltage alarm"),
            PowerEvent::CellSleep => write!(f, "Cell sleep"),
            PowerEvent::BatteryLifeAlarm1 => write!(f, "Battery life alarm 1"),
            PowerEvent::SystemStartup => write!(f, "System startup"),
            PowerEvent::OverTemperature => write!(f, "Over temperature alarm"),
            PowerEvent::HighTemperature => write!(f, "High temperature alarm"),
            PowerEvent::TemperatureNormal => write!(f, "Temperature is normal"),
            PowerEvent::LowTemperature => write!(f, "Low temperature alarm"),
            PowerEvent::UnderTemperature => write!(f, "Under temperature alarm"),
            PowerEvent::FullCharge => write!(f, "Full charge"),
            PowerEvent::NormalPower => write!(f, "Normal power"),
            PowerEvent::LowPower => write!(f, "Low power"),
            PowerEvent::ShortCircuitProtection => write!(f, "Short circuit protection"),
            PowerEvent::DischargeOvercurrent2 => {
                write!(f, "Discharge overcurrent protection 2")
            }
            PowerEvent::ChargeOvercurrent2 => write!(f, "Charging overcurrent protection 2"),
            PowerEvent::DischargeOvercurrent => write!(f, "Discharge overcurrent protection"),
            PowerEvent::ChargeOvercurrent => write!(f, "Charging overcurrent protection"),
            PowerEvent::SystemIdle => write!(f, "System idle"),
            PowerEvent::Charging => write!(f, "Charging"),
            PowerEvent::Discharging => write!(f, "Discharging"),
            PowerEvent::SystemPowerFailure => write!(f, "System power failure"),
            PowerEvent::SystemIdleAlarm => write!(f, "System idle alarm"),
            PowerEvent::ChargingAlarm => write!(f, "Charging alarm"),
            PowerEvent::DischargingAlarm => write!(f, "Discharging alarm"),
            PowerEvent::SystemError => write!(f, "System error"),
            PowerEvent::SystemHibernation => write!(f, "System hibernation"),
            PowerEvent::SystemShutdown => write!(f, "System shutdown"),
            PowerEvent::BatteryLifeAlarm2 => write!(f, "Battery life alarm 2"),
        }
    }
}

/// Bits of the `System Fault` register, in bit order. All are warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemFault {
    ReversePowerInput,
    PowerInputOvervoltage,
    CurrentDetection,
    OzAbnormal,
    SleepModule,
    TemperatureSensor,
    VoltageDetection,
    I2cBus,
    CanAddressAssignment,
    InternalCan,
    ChargeMosFail,
    DischargeMosFail,
}

impl SystemFault {
    const BITS: [SystemFault; 12] = [
        SystemFault::ReversePowerInput,
        SystemFault::PowerInputOvervoltage,
        SystemFault::CurrentDetection,
        SystemFault::OzAbnormal,
        SystemFault::SleepModule,
        SystemFault::TemperatureSensor,
        SystemFault::VoltageDetection,
        SystemFault::I2cBus,
        SystemFault::CanAddressAssignment,
        SystemFault::InternalCan,
        SystemFault::ChargeMosFail,
        SystemFault::DischargeMosFail,
    ];

    pub fn decode(register: u32) -> Vec<Self> {
        let mut result = Vec::new();
        for (bit, fault) in Self::BITS.iter().enumerate() {
            if read_bit!(register, bit) {
                result.push(*fault);
            }
        }
        result
    }
}

impl fmt::Display for SystemFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SystemFault::ReversePowerInput => {
                write!(f, "Reverse connection of external power input")
            }
            SystemFault::PowerInputOvervoltage => write!(f, "External power input overvoltage"),
            SystemFault::CurrentDetection => write!(f, "Current detection error"),
            SystemFault::OzAbnormal => write!(f, "OZ abnormal"),
            SystemFault::SleepModule => write!(f, "Sleep module abnormal"),
            SystemFault::TemperatureSensor => write!(f, "Temperature sensor error"),
            SystemFault::VoltageDetection => write!(f, "Voltage detection error"),
            SystemFault::I2cBus => write!(f, "I2C bus error"),
            SystemFault::CanAddressAssignment => write!(f, "CAN bus address assignment error"),
            SystemFault::InternalCan => write!(f, "Internal CAN bus communication error"),
            SystemFault::ChargeMosFail => write!(f, "Charge MOS FAIL"),
            SystemFault::DischargeMosFail => write!(f, "Discharge MOS FAIL"),
        }
    }
}
