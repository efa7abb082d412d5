//! Records published per unit and for the whole fleet.
//!
//! Field names follow the PascalCase layout expected by the consumer
//! (`Dc`, `Alarms`, `Info`, ...). Optional measurements that could not be
//! decoded are left out of the document instead of being zero filled.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a cell position inside a unit, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub u32);

impl CellId {
    /// Short tag used in the `System` block, e.g. `C7`.
    pub fn tag(&self) -> String {
        format!("C{}", self.0)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Cell{}", self.0)
    }
}

impl Serialize for CellId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn serialize_tag<S: Serializer>(cell: &Option<CellId>, serializer: S) -> Result<S::Ok, S::Error> {
    match cell {
        Some(cell) => serializer.serialize_str(&cell.tag()),
        None => serializer.serialize_none(),
    }
}

/// Rounds to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
}

macro_rules! alarm_flags {
    ($($field:ident),* $(,)?) => {
        /// Alarm flags, 0 or 1.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "PascalCase")]
        pub struct Alarms {
            $(pub $field: u8,)*
        }

        impl Alarms {
            /// Raises every flag that is raised in `other`.
            pub fn merge_max(&mut self, other: &Alarms) {
                $(self.$field = self.$field.max(other.$field);)*
            }

            pub fn any(&self) -> bool {
                false $(|| self.$field != 0)*
            }
        }
    };
}

alarm_flags!(
    low_voltage,
    high_voltage,
    low_soc,
    high_charge_current,
    high_discharge_current,
    high_current,
    cell_imbalance,
    high_charge_temperature,
    low_charge_temperature,
    low_cell_voltage,
    low_temperature,
    high_temperature,
    fuse_blown,
);

/// Charge parameters requested from the inverter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Info {
    pub max_charge_voltage: f64,
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_cycles: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct System {
    pub nr_of_modules_online: u32,
    pub nr_of_modules_offline: u32,
    pub nr_of_cells_per_battery: u32,
    pub nr_of_modules_blocking_charge: u32,
    pub nr_of_modules_blocking_discharge: u32,
    #[serde(rename = "MOSTemperature", skip_serializing_if = "Option::is_none")]
    pub mos_temperature: Option<f64>,
    #[serde(
        serialize_with = "serialize_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_voltage_cell_id: Option<CellId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cell_voltage: Option<f64>,
    #[serde(
        serialize_with = "serialize_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_voltage_cell_id: Option<CellId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cell_voltage: Option<f64>,
    #[serde(
        serialize_with = "serialize_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_temperature_cell_id: Option<CellId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cell_temperature: Option<f64>,
    #[serde(
        serialize_with = "serialize_tag",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_temperature_cell_id: Option<CellId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cell_temperature: Option<f64>,
}

/// Charge/discharge permission, 0 or 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Io {
    pub allow_to_charge: u8,
    pub allow_to_discharge: u8,
}

impl Default for Io {
    fn default() -> Self {
        Self {
            allow_to_charge: 1,
            allow_to_discharge: 1,
        }
    }
}

/// Telemetry of one unit, or of the whole fleet once consolidated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UnitTelemetry {
    pub dc: Dc,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_capacity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_amphours: Option<f64>,
    /// Seconds until empty at the present discharge current.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_go: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balancing: Option<u8>,
    pub alarms: Alarms,
    pub info: Info,
    pub history: History,
    pub system: System,
    pub voltages: BTreeMap<CellId, f64>,
    pub balances: BTreeMap<CellId, u8>,
    pub io: Io,
    /// Per cell temperatures in °C, kept for fleet extremes but not published.
    #[serde(skip)]
    pub temperatures: BTreeMap<CellId, f64>,
}

/// Same shape as a unit record, aggregated over all configured units.
pub type ConsolidatedTelemetry = UnitTelemetry;

impl UnitTelemetry {
    /// Seconds until empty, only while discharging.
    pub fn time_to_go(capacity: f64, current: f64) -> Option<u64> {
        if current < 0.0 {
            Some((capacity / current.abs() * 3600.0) as u64)
        } else {
            None
        }
    }

    pub fn is_online(&self) -> bool {
        self.system.nr_of_modules_online > 0
    }
}

/// Lowest and highest `(cell, value)` pair; the first one wins on ties.
pub fn extremes<I>(values: I) -> Option<((CellId, f64), (CellId, f64))>
where
    I: IntoIterator<Item = (CellId, f64)>,
{
    let mut iter = values.into_iter();
    let first = iter.next()?;
    Some(iter.fold((first, first), |(min, max), item| {
        (
            if item.1 < min.1 { item } else { min },
            if item.1 > max.1 { item } else { max },
        )
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cell_keys_sort_numerically() {
        let mut voltages = BTreeMap::new();
        voltages.insert(CellId(10), 3.3);
        voltages.insert(CellId(2), 3.2);
        voltages.insert(CellId(1), 3.1);
        let keys: Vec<String> = voltages.keys().map(|c| c.to_string()).collect();
        assert_eq!(keys, ["Cell1", "Cell2", "Cell10"]);
        assert_eq!(
            serde_json::to_value(&voltages).unwrap(),
            json!({"Cell1": 3.1, "Cell2": 3.2, "Cell10": 3.3})
        );
    }

    #[test]
    fn document_layout() {
        let mut record = UnitTelemetry::default();
        record.dc.voltage = Some(51.2);
        record.system.min_voltage_cell_id = Some(CellId(3));
        record.alarms.low_soc = 1;
        record.temperatures.insert(CellId(1), 20.0);
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["Dc"], json!({"Voltage": 51.2}));
        assert_eq!(doc["System"]["MinVoltageCellId"], json!("C3"));
        assert!(doc["System"].get("MaxVoltageCellId").is_none());
        assert_eq!(doc["Alarms"]["LowSoc"], json!(1));
        assert_eq!(doc["Alarms"]["FuseBlown"], json!(0));
        assert_eq!(doc["Io"], json!({"AllowToCharge": 1, "AllowToDischarge": 1}));
        assert!(doc.get("Soc").is_none());
        assert!(doc.get("Temperatures").is_none());
    }

    #[test]
    fn extremes_keep_first_on_ties() {
        let values = [(CellId(1), 3.3), (CellId(2), 3.2), (CellId(3), 3.3), (CellId(4), 3.2)];
        let (min, max) = extremes(values).unwrap();
        assert_eq!(min, (CellId(2), 3.2));
        assert_eq!(max, (CellId(1), 3.3));
        assert!(extremes(Vec::new()).is_none());
    }

    #[test]
    fn alarms_merge() {
        let mut a = Alarms::default();
        assert!(!a.any());
        let b = Alarms {
            fuse_blown: 1,
            ..Default::default()
        };
        a.merge_max(&b);
        assert_eq!(a.fuse_blown, 1);
        assert!(a.any());
    }

    #[test]
    fn time_to_go_only_when_discharging() {
        assert_eq!(UnitTelemetry::time_to_go(80.0, -5.0), Some(57600));
        assert_eq!(UnitTelemetry::time_to_go(80.0, 0.0), None);
        assert_eq!(UnitTelemetry::time_to_go(80.0, 5.0), None);
    }
}
