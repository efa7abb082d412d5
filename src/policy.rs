//! Derating and alarm policy for a single unit.
//!
//! [`evaluate`] turns the decoded `pwr` and `bat` responses of one unit into
//! its published record. Limits are derived from the fleet ceilings learned at
//! startup and then clamped by state of charge, pack temperature and cell
//! voltages. Event registers are decomposed bit by bit.

use crate::limits::FleetLimits;
use crate::protocol::{Address, CellReading, PowerEvent, PowerReport, Severity, SystemFault};
use crate::telemetry::{extremes, round_to, Alarms, CellId, Info, System, UnitTelemetry};

pub const BULK_CHARGE_VOLTAGE: f64 = 52.5;
pub const FLOAT_CHARGE_VOLTAGE: f64 = 51.0;
const FLOAT_SOC: u32 = 95;

const TOP_OFF_SOC: u32 = 90;
const TOP_OFF_CURRENT: f64 = 7.0;
const DERATING_FACTOR: f64 = 0.8;

const COOL_CHARGE_TEMPERATURE: f64 = 5.0;
const HOT_CHARGE_TEMPERATURE: f64 = 45.0;
const THERMAL_CURRENT_LIMIT: f64 = 10.0;

const EMPTY_SOC: u32 = 5;
const LOW_SOC: u32 = 10;
const LOW_SOC_DISCHARGE_LIMIT: f64 = 10.0;

const CELL_OVERVOLTAGE: f64 = 3.65;
const CELL_UNDERVOLTAGE: f64 = 2.5;
const BALANCE_SPREAD: f64 = 0.05;
const BALANCE_THRESHOLD: f64 = 3.4;
const IMBALANCE_SPREAD: f64 = 0.1;
const CELL_LOW_TEMPERATURE: f64 = 0.0;
const CELL_HIGH_TEMPERATURE: f64 = 45.0;

fn flag(condition: bool) -> u8 {
    u8::from(condition)
}

/// Builds the record of `address` from its decoded responses.
pub fn evaluate(
    address: Address,
    power: &PowerReport,
    cells: &[CellReading],
    limits: &FleetLimits,
) -> UnitTelemetry {
    let mut data = UnitTelemetry {
        info: Info {
            max_charge_voltage: limits.max_charge_voltage(),
            max_charge_current: limits.max_charge_current(),
            max_discharge_current: limits.max_discharge_current(),
        },
        system: System {
            nr_of_modules_online: 1,
            nr_of_cells_per_battery: limits.cell_count(),
            ..Default::default()
        },
        ..Default::default()
    };

    apply_measurements(&mut data, power);
    apply_charge_limits(address, &mut data, limits);
    apply_discharge_limits(address, &mut data);
    apply_derived(&mut data);
    apply_registers(address, &mut data.alarms, power);
    apply_cells(address, &mut data, cells);

    data.system.nr_of_modules_blocking_charge = u32::from(data.io.allow_to_charge == 0);
    data.system.nr_of_modules_blocking_discharge = u32::from(data.io.allow_to_discharge == 0);
    data
}

fn apply_measurements(data: &mut UnitTelemetry, power: &PowerReport) {
    data.dc.voltage = power.voltage.map(|mv| round_to(mv / 1000.0, 2));
    data.dc.current = power.current.map(|ma| round_to(ma / 1000.0, 2));
    data.dc.temperature = power.temperature.map(|mc| round_to(mc / 1000.0, 1));
    data.system.mos_temperature = data.dc.temperature;
    data.soc = power.coulomb;
    data.installed_capacity = power.total_coulomb.map(|mah| round_to(mah / 1000.0, 1));
    data.balancing = power.heater_on.map(flag);
    data.history.charge_cycles = power.charge_times;
}

fn apply_charge_limits(address: Address, data: &mut UnitTelemetry, limits: &FleetLimits) {
    if let Some(soc) = data.soc {
        data.info.max_charge_voltage = if soc < FLOAT_SOC {
            BULK_CHARGE_VOLTAGE
        } else {
            FLOAT_CHARGE_VOLTAGE
        };
        data.info.max_charge_current = if soc > TOP_OFF_SOC {
            TOP_OFF_CURRENT
        } else {
            round_to(limits.max_charge_current() * DERATING_FACTOR, 1)
        };
        log::debug!(
            "Unit {address}: SoC {soc}% -> MaxChargeVoltage {} V, MaxChargeCurrent {} A",
            data.info.max_charge_voltage,
            data.info.max_charge_current
        );
    }

    if let Some(temperature) = data.dc.temperature {
        if temperature < 0.0 {
            data.io.allow_to_charge = 0;
            data.info.max_charge_current = 0.0;
            data.alarms.low_charge_temperature = 1;
            log::debug!("Unit {address}: charging disabled, temperature {temperature} °C");
        } else if temperature < COOL_CHARGE_TEMPERATURE {
            data.info.max_charge_current = data.info.max_charge_current.min(THERMAL_CURRENT_LIMIT);
            log::debug!("Unit {address}: charge current limited, temperature {temperature} °C");
        } else if temperature > HOT_CHARGE_TEMPERATURE {
            data.info.max_charge_current = data.info.max_charge_current.min(THERMAL_CURRENT_LIMIT);
            data.alarms.high_charge_temperature = 1;
            log::debug!("Unit {address}: charge current limited, temperature {temperature} °C");
        }
    }
}

fn apply_discharge_limits(address: Address, data: &mut UnitTelemetry) {
    let Some(soc) = data.soc else {
        return;
    };
    if soc < EMPTY_SOC {
        data.io.allow_to_discharge = 0;
        data.info.max_discharge_current = 0.0;
        data.alarms.low_soc = 1;
        log::debug!("Unit {address}: discharging disabled, SoC {soc}%");
    } else if soc < LOW_SOC {
        data.info.max_discharge_current =
            data.info.max_discharge_current.min(LOW_SOC_DISCHARGE_LIMIT);
        data.alarms.low_soc = 1;
        log::debug!("Unit {address}: discharge current limited, SoC {soc}%");
    }
}

fn apply_derived(data: &mut UnitTelemetry) {
    if let (Some(voltage), Some(current)) = (data.dc.voltage, data.dc.current) {
        data.dc.power = Some(round_to(voltage * current, 1));
    }
    if let (Some(soc), Some(installed)) = (data.soc, data.installed_capacity) {
        let capacity = round_to(f64::from(soc) / 100.0 * installed, 1);
        data.capacity = Some(capacity);
        data.consumed_amphours = Some(round_to(installed - capacity, 1));
    }
    if let (Some(capacity), Some(current)) = (data.capacity, data.dc.current) {
        data.time_to_go = UnitTelemetry::time_to_go(capacity, current);
    }
}

/// Alarm raised by a single `Power Events` bit.
fn power_event_alarm(alarms: &mut Alarms, event: PowerEvent) -> Option<&mut u8> {
    match event {
        PowerEvent::Overvoltage | PowerEvent::HighVoltage => Some(&mut alarms.high_voltage),
        PowerEvent::LowVoltage => Some(&mut alarms.low_voltage),
        PowerEvent::Undervoltage => Some(&mut alarms.low_cell_voltage),
        PowerEvent::OverTemperature | PowerEvent::HighTemperature => {
            Some(&mut alarms.high_temperature)
        }
        PowerEvent::LowTemperature | PowerEvent::UnderTemperature => {
            Some(&mut alarms.low_temperature)
        }
        PowerEvent::LowPower => Some(&mut alarms.low_soc),
        PowerEvent::DischargeOvercurrent | PowerEvent::DischargeOvercurrent2 => {
            Some(&mut alarms.high_discharge_current)
        }
        PowerEvent::ChargeOvercurrent | PowerEvent::ChargeOvercurrent2 => {
            Some(&mut alarms.high_charge_current)
        }
        PowerEvent::ShortCircuitProtection => Some(&mut alarms.fuse_blown),
        _ => None,
    }
}

fn apply_registers(address: Address, alarms: &mut Alarms, power: &PowerReport) {
    if let Some(register) = power.bat_events {
        for event in PowerEvent::decode(register) {
            if event.severity() == Severity::Warning {
                alarms.cell_imbalance = 1;
                log::debug!("Unit {address}: battery event '{event}' -> CellImbalance");
            }
        }
    }

    if let Some(register) = power.power_events {
        for event in PowerEvent::decode(register) {
            let raised = flag(event.severity() == Severity::Warning);
            if let Some(alarm) = power_event_alarm(alarms, event) {
                *alarm = (*alarm).max(raised);
                log::debug!("Unit {address}: power event '{event}' -> {raised}");
            } else {
                log::trace!("Unit {address}: power event '{event}' has no alarm");
            }
        }
    }

    if let Some(register) = power.system_fault {
        for fault in SystemFault::decode(register) {
            alarms.fuse_blown = alarms.fuse_blown.max(1);
            log::debug!("Unit {address}: system fault '{fault}' -> FuseBlown");
        }
    }
}

fn apply_cells(address: Address, data: &mut UnitTelemetry, cells: &[CellReading]) {
    let voltages: Vec<(CellId, f64)> = cells
        .iter()
        .map(|cell| (CellId(cell.index), cell.voltage / 1000.0))
        .collect();
    let temperatures: Vec<(CellId, f64)> = cells
        .iter()
        .map(|cell| (CellId(cell.index), cell.temperature / 1000.0))
        .collect();

    let Some(((min_id, min_v), (max_id, max_v))) = extremes(voltages.iter().copied()) else {
        return;
    };

    data.system.nr_of_cells_per_battery = cells.len() as u32;
    for (id, volts) in &voltages {
        data.voltages.insert(*id, round_to(*volts, 3));
    }
    for (id, celsius) in &temperatures {
        data.temperatures.insert(*id, round_to(*celsius, 1));
    }
    data.system.min_voltage_cell_id = Some(min_id);
    data.system.min_cell_voltage = Some(round_to(min_v, 3));
    data.system.max_voltage_cell_id = Some(max_id);
    data.system.max_cell_voltage = Some(round_to(max_v, 3));

    if max_v > CELL_OVERVOLTAGE {
        data.info.max_charge_current = 0.0;
        data.io.allow_to_charge = 0;
        data.alarms.high_voltage = 1;
        log::debug!("Unit {address}: charging disabled, {max_id} at {max_v} V");
    }
    if min_v < CELL_UNDERVOLTAGE {
        data.io.allow_to_discharge = 0;
        data.alarms.low_cell_voltage = 1;
        log::debug!("Unit {address}: discharging disabled, {min_id} at {min_v} V");
    }

    let spread = max_v - min_v;
    for (id, _) in &voltages {
        data.balances.insert(*id, 0);
    }
    if spread > BALANCE_SPREAD && max_v > BALANCE_THRESHOLD {
        data.balances.insert(max_id, 1);
        log::debug!("Unit {address}: balancing {max_id}, spread {spread:.3} V");
    }
    if spread > IMBALANCE_SPREAD {
        data.alarms.cell_imbalance = 1;
        log::debug!("Unit {address}: cell imbalance, spread {spread:.3} V");
    }

    if let Some(((min_id, min_t), (max_id, max_t))) = extremes(temperatures) {
        data.system.min_temperature_cell_id = Some(min_id);
        data.system.min_cell_temperature = Some(round_to(min_t, 1));
        data.system.max_temperature_cell_id = Some(max_id);
        data.system.max_cell_temperature = Some(round_to(max_t, 1));
        if min_t < CELL_LOW_TEMPERATURE {
            data.alarms.low_temperature = 1;
        }
        if max_t > CELL_HIGH_TEMPERATURE {
            data.alarms.high_temperature = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Ceilings;
    use crate::protocol::{decode_bat, decode_pwr};

    fn limits() -> FleetLimits {
        FleetLimits::new(Ceilings::default())
    }

    fn power(soc: u32, temperature_c: f64) -> PowerReport {
        PowerReport {
            voltage: Some(51200.0),
            current: Some(-5000.0),
            temperature: Some(temperature_c * 1000.0),
            coulomb: Some(soc),
            total_coulomb: Some(100000.0),
            ..Default::default()
        }
    }

    fn cell(index: u32, mv: f64) -> CellReading {
        CellReading {
            index,
            voltage: mv,
            temperature: 20000.0,
            soc: 50,
        }
    }

    #[test]
    fn normalises_pwr_response() {
        let report = decode_pwr(&["Voltage:51200 mV", "Current:-5000 mA", "Coulomb:80 %"]);
        let data = evaluate(1, &report, &[], &limits());
        assert_eq!(data.dc.voltage, Some(51.2));
        assert_eq!(data.dc.current, Some(-5.0));
        assert_eq!(data.dc.power, Some(-256.0));
        assert_eq!(data.soc, Some(80));
        assert_eq!(data.dc.temperature, None);
        assert_eq!(data.capacity, None);
    }

    #[test]
    fn derived_capacity_and_time_to_go() {
        let data = evaluate(1, &power(80, 20.0), &[], &limits());
        assert_eq!(data.installed_capacity, Some(100.0));
        assert_eq!(data.capacity, Some(80.0));
        assert_eq!(data.consumed_amphours, Some(20.0));
        assert_eq!(data.time_to_go, Some(57600));

        let mut charging = power(80, 20.0);
        charging.current = Some(5000.0);
        assert_eq!(evaluate(1, &charging, &[], &limits()).time_to_go, None);
    }

    #[test]
    fn charge_voltage_schedule() {
        assert_eq!(evaluate(1, &power(94, 20.0), &[], &limits()).info.max_charge_voltage, 52.5);
        assert_eq!(evaluate(1, &power(95, 20.0), &[], &limits()).info.max_charge_voltage, 51.0);
    }

    #[test]
    fn charge_current_derating() {
        let data = evaluate(1, &power(50, 20.0), &[], &limits());
        assert_eq!(data.info.max_charge_current, 40.0);
        let data = evaluate(1, &power(95, 20.0), &[], &limits());
        assert_eq!(data.info.max_charge_current, 7.0);
        let data = evaluate(1, &power(90, 20.0), &[], &limits());
        assert_eq!(data.info.max_charge_current, 40.0);
    }

    #[test]
    fn temperature_clamps() {
        let cold = evaluate(1, &power(50, -1.0), &[], &limits());
        assert_eq!(cold.io.allow_to_charge, 0);
        assert_eq!(cold.info.max_charge_current, 0.0);
        assert_eq!(cold.alarms.low_charge_temperature, 1);
        assert_eq!(cold.system.nr_of_modules_blocking_charge, 1);

        let cool = evaluate(1, &power(50, 3.0), &[], &limits());
        assert_eq!(cool.info.max_charge_current, 10.0);
        assert_eq!(cool.alarms.high_charge_temperature, 0);

        let hot = evaluate(1, &power(50, 50.0), &[], &limits());
        assert!(hot.info.max_charge_current <= 10.0);
        assert_eq!(hot.alarms.high_charge_temperature, 1);
        assert_eq!(hot.io.allow_to_charge, 1);

        let mild = evaluate(1, &power(50, 20.0), &[], &limits());
        assert_eq!(mild.info.max_charge_current, 40.0);
        assert_eq!(mild.io.allow_to_charge, 1);
        assert_eq!(mild.alarms.low_charge_temperature, 0);
        assert_eq!(mild.alarms.high_charge_temperature, 0);
    }

    #[test]
    fn discharge_limits() {
        let empty = evaluate(1, &power(4, 20.0), &[], &limits());
        assert_eq!(empty.io.allow_to_discharge, 0);
        assert_eq!(empty.info.max_discharge_current, 0.0);
        assert_eq!(empty.alarms.low_soc, 1);

        let low = evaluate(1, &power(7, 20.0), &[], &limits());
        assert_eq!(low.io.allow_to_discharge, 1);
        assert_eq!(low.info.max_discharge_current, 10.0);
        assert_eq!(low.alarms.low_soc, 1);

        let fine = evaluate(1, &power(10, 20.0), &[], &limits());
        assert_eq!(fine.info.max_discharge_current, 50.0);
        assert_eq!(fine.alarms.low_soc, 0);
    }

    #[test]
    fn temperature_boundaries() {
        let freezing = evaluate(1, &power(50, 0.0), &[], &limits());
        assert_eq!(freezing.info.max_charge_current, 10.0);
        assert_eq!(freezing.io.allow_to_charge, 1);
        assert_eq!(freezing.alarms.low_charge_temperature, 0);

        for celsius in [5.0, 45.0] {
            let data = evaluate(1, &power(50, celsius), &[], &limits());
            assert_eq!(data.info.max_charge_current, 40.0, "{celsius} °C");
            assert_eq!(data.io.allow_to_charge, 1, "{celsius} °C");
            assert_eq!(data.alarms.high_charge_temperature, 0, "{celsius} °C");
            assert_eq!(data.alarms.low_charge_temperature, 0, "{celsius} °C");
        }
    }

    #[test]
    fn soc_boundary_limits_discharge() {
        let data = evaluate(1, &power(5, 20.0), &[], &limits());
        assert_eq!(data.io.allow_to_discharge, 1);
        assert_eq!(data.info.max_discharge_current, 10.0);
        assert_eq!(data.alarms.low_soc, 1);
        assert_eq!(data.system.nr_of_modules_blocking_discharge, 0);
    }

    #[test]
    fn cell_voltage_boundaries() {
        let cells = [cell(1, 3650.0), cell(2, 2500.0)];
        let data = evaluate(1, &power(50, 20.0), &cells, &limits());
        assert_eq!(data.info.max_charge_current, 40.0);
        assert_eq!(data.io.allow_to_charge, 1);
        assert_eq!(data.io.allow_to_discharge, 1);
        assert_eq!(data.alarms.high_voltage, 0);
        assert_eq!(data.alarms.low_cell_voltage, 0);
        assert_eq!(data.system.max_cell_voltage, Some(3.65));
        assert_eq!(data.system.min_cell_voltage, Some(2.5));
    }

    #[test]
    fn missing_fields_stay_absent() {
        let data = evaluate(1, &PowerReport::default(), &[], &limits());
        assert_eq!(data.soc, None);
        assert_eq!(data.dc.power, None);
        assert_eq!(data.info.max_charge_current, 50.0);
        assert_eq!(data.info.max_charge_voltage, 51.0);
        assert!(data.voltages.is_empty());
        assert!(!data.alarms.any());
    }

    #[test]
    fn cell_voltage_clamps() {
        let cells = [cell(1, 3660.0), cell(2, 3600.0), cell(3, 2400.0)];
        let data = evaluate(1, &power(50, 20.0), &cells, &limits());
        assert_eq!(data.info.max_charge_current, 0.0);
        assert_eq!(data.io.allow_to_charge, 0);
        assert_eq!(data.alarms.high_voltage, 1);
        assert_eq!(data.io.allow_to_discharge, 0);
        assert_eq!(data.alarms.low_cell_voltage, 1);
        assert_eq!(data.alarms.cell_imbalance, 1);
        assert_eq!(data.system.min_voltage_cell_id, Some(CellId(3)));
        assert_eq!(data.system.max_cell_voltage, Some(3.66));
        assert_eq!(data.system.nr_of_cells_per_battery, 3);
    }

    #[test]
    fn balancing_selects_highest_cell() {
        let cells = [cell(1, 3400.0), cell(2, 3460.0), cell(3, 3410.0)];
        let data = evaluate(1, &power(50, 20.0), &cells, &limits());
        assert_eq!(data.balances.get(&CellId(2)), Some(&1));
        assert_eq!(data.balances.values().filter(|b| **b == 1).count(), 1);
        assert_eq!(data.alarms.cell_imbalance, 0);
    }

    #[test]
    fn no_balancing_below_threshold_voltage() {
        let cells = [cell(1, 3300.0), cell(2, 3390.0)];
        let data = evaluate(1, &power(50, 20.0), &cells, &limits());
        assert!(data.balances.values().all(|b| *b == 0));
        assert_eq!(data.balances.len(), 2);

        let cells = [cell(1, 3420.0), cell(2, 3450.0)];
        let data = evaluate(1, &power(50, 20.0), &cells, &limits());
        assert!(data.balances.values().all(|b| *b == 0));
    }

    #[test]
    fn cell_temperature_alarms() {
        let mut cold = cell(1, 3300.0);
        cold.temperature = -500.0;
        let mut hot = cell(2, 3300.0);
        hot.temperature = 46000.0;
        let data = evaluate(1, &power(50, 20.0), &[cold, hot], &limits());
        assert_eq!(data.alarms.low_temperature, 1);
        assert_eq!(data.alarms.high_temperature, 1);
        assert_eq!(data.system.min_temperature_cell_id, Some(CellId(1)));
        assert_eq!(data.system.max_cell_temperature, Some(46.0));
    }

    #[test]
    fn multi_bit_registers_raise_every_alarm() {
        let mut report = power(50, 20.0);
        report.power_events = Some(0x2 | 0x8 | 0x10000 | 0x400000);
        report.system_fault = Some(0x800);
        report.bat_events = Some(0x4);
        let data = evaluate(1, &report, &[], &limits());
        assert_eq!(data.alarms.high_voltage, 1);
        assert_eq!(data.alarms.low_voltage, 1);
        assert_eq!(data.alarms.fuse_blown, 1);
        // 0x4 is an informational bit
        assert_eq!(data.alarms.cell_imbalance, 0);
        assert_eq!(data.alarms.high_charge_current, 0);
    }

    #[test]
    fn battery_event_warning_raises_imbalance() {
        let mut report = power(50, 20.0);
        report.bat_events = Some(0x20);
        assert_eq!(evaluate(1, &report, &[], &limits()).alarms.cell_imbalance, 1);
    }

    #[test]
    fn decoded_table_feeds_cells() {
        let lines = [
            "Battery  Volt  Curr  Tempr  Base  V.St  C.St  T.St  SOC  Coulomb",
            "0  3335  -1000  24000  Dischg  Normal  Normal  Normal  80%  80000",
            "1  3341  -1000  24500  Dischg  Normal  Normal  Normal  81%  80000",
        ];
        let data = evaluate(1, &power(80, 20.0), &decode_bat(&lines), &limits());
        assert_eq!(data.voltages.get(&CellId(1)), Some(&3.335));
        assert_eq!(data.voltages.get(&CellId(2)), Some(&3.341));
        assert_eq!(data.temperatures.get(&CellId(2)), Some(&24.5));
    }
}
