//! Consolidation of all unit records into one fleet record.
//!
//! The fleet record is a pure function of the records of the current cycle.
//! Units that did not answer take part through their synthetic offline
//! record, which blocks charging and discharging for the whole fleet.

use crate::limits::FleetLimits;
use crate::telemetry::{
    extremes, round_to, CellId, ConsolidatedTelemetry, Info, Io, System, UnitTelemetry,
};
use std::collections::BTreeMap;

const IMBALANCE_SPREAD: f64 = 0.1;

/// Record standing in for a unit that did not answer this cycle.
pub fn offline_record(limits: &FleetLimits) -> UnitTelemetry {
    let mut data = UnitTelemetry {
        info: Info {
            max_charge_voltage: limits.max_charge_voltage(),
            max_charge_current: 0.0,
            max_discharge_current: 0.0,
        },
        system: System {
            nr_of_modules_online: 0,
            nr_of_modules_offline: 1,
            nr_of_cells_per_battery: limits.cell_count(),
            nr_of_modules_blocking_charge: 1,
            nr_of_modules_blocking_discharge: 1,
            ..Default::default()
        },
        io: Io {
            allow_to_charge: 0,
            allow_to_discharge: 0,
        },
        ..Default::default()
    };
    data.alarms.low_soc = 1;
    data
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn sum(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum())
    }
}

fn min_info(units: &[UnitTelemetry], field: fn(&Info) -> f64) -> f64 {
    units
        .iter()
        .map(|u| field(&u.info))
        .fold(f64::INFINITY, f64::min)
}

fn collect<F>(units: &[UnitTelemetry], field: F) -> Vec<f64>
where
    F: Fn(&UnitTelemetry) -> Option<f64>,
{
    units.iter().filter_map(field).collect()
}

/// Consolidates the records of all configured units, `None` if there are none.
pub fn consolidate(units: &[UnitTelemetry], limits: &FleetLimits) -> Option<ConsolidatedTelemetry> {
    if units.is_empty() {
        return None;
    }
    let count = units.len() as f64;

    let mut fleet = ConsolidatedTelemetry {
        info: Info {
            max_charge_voltage: limits.max_charge_voltage(),
            max_charge_current: 0.0,
            max_discharge_current: 0.0,
        },
        system: System {
            nr_of_cells_per_battery: limits.cell_count(),
            ..Default::default()
        },
        ..Default::default()
    };

    for unit in units {
        fleet.alarms.merge_max(&unit.alarms);
        fleet.io.allow_to_charge = fleet.io.allow_to_charge.min(unit.io.allow_to_charge);
        fleet.io.allow_to_discharge = fleet.io.allow_to_discharge.min(unit.io.allow_to_discharge);
        fleet.system.nr_of_modules_online += unit.system.nr_of_modules_online;
        fleet.system.nr_of_modules_offline += unit.system.nr_of_modules_offline;
        fleet.system.nr_of_modules_blocking_charge += u32::from(unit.io.allow_to_charge == 0);
        fleet.system.nr_of_modules_blocking_discharge +=
            u32::from(unit.io.allow_to_discharge == 0);
    }

    consolidate_cells(&mut fleet, units);

    let voltage = collect(units, |u| u.dc.voltage);
    let current = collect(units, |u| u.dc.current);
    let power = collect(units, |u| u.dc.power);
    let temperature = collect(units, |u| u.dc.temperature);
    let soc = collect(units, |u| u.soc.map(f64::from));
    let installed = collect(units, |u| u.installed_capacity);
    let capacity = collect(units, |u| u.capacity);
    let consumed = collect(units, |u| u.consumed_amphours);
    let cycles = collect(units, |u| u.history.charge_cycles.map(f64::from));

    fleet.dc.voltage = mean(&voltage).map(|v| round_to(v, 2));
    fleet.dc.current = sum(&current).map(|v| round_to(v, 2));
    fleet.dc.power = sum(&power).map(|v| round_to(v, 1));
    fleet.dc.temperature = mean(&temperature).map(|v| round_to(v, 1));
    fleet.system.mos_temperature = fleet.dc.temperature;
    fleet.soc = mean(&soc).map(|v| v.round() as u32);
    fleet.installed_capacity = sum(&installed).map(|v| round_to(v, 1));
    fleet.capacity = sum(&capacity).map(|v| round_to(v, 1));
    fleet.consumed_amphours = sum(&consumed).map(|v| round_to(v, 1));
    fleet.history.charge_cycles = mean(&cycles).map(|v| v.round() as u32);

    // The most restrictive unit applies to every unit in parallel.
    fleet.info.max_charge_voltage = min_info(units, |i| i.max_charge_voltage);
    fleet.info.max_charge_current =
        round_to(min_info(units, |i| i.max_charge_current) * count, 1);
    fleet.info.max_discharge_current =
        round_to(min_info(units, |i| i.max_discharge_current) * count, 1);
    log::debug!(
        "Consolidated limits: {} V, charge {} A, discharge {} A",
        fleet.info.max_charge_voltage,
        fleet.info.max_charge_current,
        fleet.info.max_discharge_current
    );

    if let (Some(capacity), Some(current)) = (fleet.capacity, fleet.dc.current) {
        fleet.time_to_go = UnitTelemetry::time_to_go(capacity, current);
    }

    Some(fleet)
}

fn consolidate_cells(fleet: &mut ConsolidatedTelemetry, units: &[UnitTelemetry]) {
    let mut voltages: BTreeMap<CellId, Vec<f64>> = BTreeMap::new();
    let mut balancing: BTreeMap<CellId, bool> = BTreeMap::new();
    for unit in units {
        for (cell, volts) in &unit.voltages {
            voltages.entry(*cell).or_default().push(*volts);
        }
        for (cell, balance) in &unit.balances {
            *balancing.entry(*cell).or_default() |= *balance != 0;
        }
    }
    for (cell, readings) in &voltages {
        if let Some(avg) = mean(readings) {
            fleet.voltages.insert(*cell, round_to(avg, 3));
            let balance = balancing.get(cell).copied().unwrap_or(false);
            fleet.balances.insert(*cell, u8::from(balance));
        }
    }

    let all_voltages = units
        .iter()
        .flat_map(|u| u.voltages.iter().map(|(cell, volts)| (*cell, *volts)));
    if let Some(((min_id, min_v), (max_id, max_v))) = extremes(all_voltages) {
        fleet.system.min_voltage_cell_id = Some(min_id);
        fleet.system.min_cell_voltage = Some(round_to(min_v, 3));
        fleet.system.max_voltage_cell_id = Some(max_id);
        fleet.system.max_cell_voltage = Some(round_to(max_v, 3));
        if max_v - min_v > IMBALANCE_SPREAD {
            fleet.alarms.cell_imbalance = 1;
        }
    }

    let all_temperatures = units
        .iter()
        .flat_map(|u| u.temperatures.iter().map(|(cell, celsius)| (*cell, *celsius)));
    if let Some(((min_id, min_t), (max_id, max_t))) = extremes(all_temperatures) {
        fleet.system.min_temperature_cell_id = Some(min_id);
        fleet.system.min_cell_temperature = Some(round_to(min_t, 1));
        fleet.system.max_temperature_cell_id = Some(max_id);
        fleet.system.max_cell_temperature = Some(round_to(max_t, 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Ceilings;
    use crate::policy::evaluate;
    use crate::protocol::{CellReading, PowerReport};

    fn limits() -> FleetLimits {
        FleetLimits::new(Ceilings::default())
    }

    fn unit(soc: u32, current_ma: f64, cells_mv: &[f64]) -> UnitTelemetry {
        let power = PowerReport {
            voltage: Some(52000.0),
            current: Some(current_ma),
            temperature: Some(20000.0),
            coulomb: Some(soc),
            total_coulomb: Some(100000.0),
            charge_times: Some(10),
            ..Default::default()
        };
        let cells: Vec<CellReading> = cells_mv
            .iter()
            .enumerate()
            .map(|(i, mv)| CellReading {
                index: i as u32 + 1,
                voltage: *mv,
                temperature: 20000.0 + i as f64 * 1000.0,
                soc,
            })
            .collect();
        evaluate(1, &power, &cells, &limits())
    }

    #[test]
    fn empty_fleet() {
        assert!(consolidate(&[], &limits()).is_none());
    }

    #[test]
    fn offline_record_blocks_everything() {
        let record = offline_record(&limits());
        assert_eq!(record.io.allow_to_charge, 0);
        assert_eq!(record.io.allow_to_discharge, 0);
        assert_eq!(record.alarms.low_soc, 1);
        assert_eq!(record.system.nr_of_modules_offline, 1);
        assert_eq!(record.system.nr_of_modules_online, 0);
        assert!(!record.is_online());
    }

    #[test]
    fn sums_means_and_limits() {
        let a = unit(60, -10000.0, &[3300.0, 3310.0]);
        let b = unit(71, -6000.0, &[3320.0, 3330.0]);
        let fleet = consolidate(&[a, b], &limits()).unwrap();
        assert_eq!(fleet.dc.voltage, Some(52.0));
        assert_eq!(fleet.dc.current, Some(-16.0));
        assert_eq!(fleet.dc.power, Some(-832.0));
        assert_eq!(fleet.soc, Some(66));
        assert_eq!(fleet.installed_capacity, Some(200.0));
        assert_eq!(fleet.capacity, Some(131.0));
        assert_eq!(fleet.history.charge_cycles, Some(10));
        assert_eq!(fleet.info.max_charge_voltage, 52.5);
        assert_eq!(fleet.info.max_charge_current, 80.0);
        assert_eq!(fleet.info.max_discharge_current, 100.0);
        assert_eq!(fleet.time_to_go, Some((131.0 / 16.0 * 3600.0) as u64));
        assert_eq!(fleet.system.nr_of_modules_online, 2);
        assert_eq!(fleet.system.nr_of_modules_offline, 0);
        assert_eq!(fleet.io.allow_to_charge, 1);
    }

    #[test]
    fn per_cell_identity_is_preserved() {
        let a = unit(60, -1000.0, &[3300.0, 3500.0, 3320.0]);
        let b = unit(60, -1000.0, &[3310.0, 3320.0, 3330.0]);
        let fleet = consolidate(&[a.clone(), b.clone()], &limits()).unwrap();
        assert_eq!(fleet.voltages.get(&CellId(1)), Some(&3.305));
        assert_eq!(fleet.voltages.get(&CellId(2)), Some(&3.41));
        assert_eq!(fleet.balances.get(&CellId(2)), Some(&1));
        assert_eq!(fleet.balances.get(&CellId(1)), Some(&0));
        assert_eq!(fleet.system.max_voltage_cell_id, Some(CellId(2)));
        assert_eq!(fleet.system.min_voltage_cell_id, Some(CellId(1)));
        assert_eq!(fleet.alarms.cell_imbalance, 1);

        let min = fleet.system.min_cell_voltage.unwrap();
        let max = fleet.system.max_cell_voltage.unwrap();
        for record in [&a, &b] {
            for volts in record.voltages.values() {
                assert!(min <= *volts && *volts <= max);
            }
        }
        assert_eq!(fleet.system.max_cell_temperature, Some(22.0));
        assert_eq!(fleet.system.max_temperature_cell_id, Some(CellId(3)));
    }

    #[test]
    fn fleet_spread_raises_imbalance_across_units() {
        let a = unit(60, -1000.0, &[3300.0, 3310.0]);
        let b = unit(60, -1000.0, &[3400.0, 3420.0]);
        assert_eq!(a.alarms.cell_imbalance, 0);
        assert_eq!(b.alarms.cell_imbalance, 0);
        let fleet = consolidate(&[a, b], &limits()).unwrap();
        assert_eq!(fleet.alarms.cell_imbalance, 1);
    }

    #[test]
    fn offline_unit_drags_fleet_down() {
        let a = unit(60, -1000.0, &[3300.0]);
        let fleet = consolidate(&[a, offline_record(&limits())], &limits()).unwrap();
        assert_eq!(fleet.io.allow_to_charge, 0);
        assert_eq!(fleet.io.allow_to_discharge, 0);
        assert_eq!(fleet.alarms.low_soc, 1);
        assert_eq!(fleet.info.max_charge_current, 0.0);
        assert_eq!(fleet.info.max_charge_voltage, 51.0);
        assert_eq!(fleet.system.nr_of_modules_online, 1);
        assert_eq!(fleet.system.nr_of_modules_offline, 1);
        assert_eq!(fleet.system.nr_of_modules_blocking_charge, 1);
        assert_eq!(fleet.soc, Some(60));
        assert_eq!(fleet.dc.current, Some(-1.0));
    }
}
