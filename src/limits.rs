use crate::protocol::{Address, InfoReport};
use std::collections::BTreeMap;

/// Ceilings configured for the installation.
#[derive(Debug, Clone, PartialEq)]
pub struct Ceilings {
    /// V, also used for units that are offline
    pub max_charge_voltage: f64,
    /// A
    pub max_charge_current: f64,
    /// A
    pub max_discharge_current: f64,
    pub cell_count: u32,
}

impl Default for Ceilings {
    fn default() -> Self {
        Self {
            max_charge_voltage: 51.0,
            max_charge_current: 50.0,
            max_discharge_current: 50.0,
            cell_count: 15,
        }
    }
}

/// What a unit reported about itself at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitInfo {
    /// A
    pub max_charge_current: Option<f64>,
    /// A
    pub max_discharge_current: Option<f64>,
    pub barcode: Option<String>,
    pub cell_count: Option<u32>,
}

/// Fleet wide ceilings learned from the units' `info` reports.
///
/// The learned current ceilings start at the configured defaults and can only
/// go down: each report is folded in with `min`.
#[derive(Debug, Clone)]
pub struct FleetLimits {
    ceilings: Ceilings,
    max_charge_current: f64,
    max_discharge_current: f64,
    cell_count: u32,
    units: BTreeMap<Address, UnitInfo>,
}

impl FleetLimits {
    pub fn new(ceilings: Ceilings) -> Self {
        Self {
            max_charge_current: ceilings.max_charge_current,
            max_discharge_current: ceilings.max_discharge_current,
            cell_count: ceilings.cell_count,
            ceilings,
            units: BTreeMap::new(),
        }
    }

    /// Folds an `info` report of `address` into the limits.
    pub fn learn(&mut self, address: Address, report: &InfoReport) {
        let unit = UnitInfo {
            max_charge_current: report.max_charge_current.map(|ma| ma / 1000.0),
            max_discharge_current: report.max_discharge_current.map(|ma| ma.abs() / 1000.0),
            barcode: report.barcode.clone(),
            cell_count: report.cell_count,
        };
        if let Some(current) = unit.max_charge_current {
            self.max_charge_current = self.max_charge_current.min(current);
            log::debug!(
                "Unit {address} reports MaxChargeCurrent {current} A, fleet ceiling {} A",
                self.max_charge_current
            );
        }
        if let Some(current) = unit.max_discharge_current {
            self.max_discharge_current = self.max_discharge_current.min(current);
            log::debug!(
                "Unit {address} reports MaxDischargeCurrent {current} A, fleet ceiling {} A",
                self.max_discharge_current
            );
        }
        if let Some(cells) = unit.cell_count {
            self.cell_count = cells;
        }
        self.units.insert(address, unit);
    }

    pub fn ceilings(&self) -> &Ceilings {
        &self.ceilings
    }

    pub fn max_charge_voltage(&self) -> f64 {
        self.ceilings.max_charge_voltage
    }

    pub fn max_charge_current(&self) -> f64 {
        self.max_charge_current
    }

    pub fn max_discharge_current(&self) -> f64 {
        self.max_discharge_current
    }

    pub fn cell_count(&self) -> u32 {
        self.cell_count
    }

    pub fn unit(&self, address: Address) -> Option<&UnitInfo> {
        self.units.get(&address)
    }

    pub fn barcode(&self, address: Address) -> String {
        self.unit(address)
            .and_then(|unit| unit.barcode.clone())
            .unwrap_or_else(|| format!("UNKNOWN_{address}"))
    }
}
