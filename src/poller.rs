use crate::fleet;
use crate::limits::FleetLimits;
use crate::link::{LineBatch, LinkSession, Port};
use crate::policy;
use crate::protocol::{decode_bat, decode_info, decode_pwr, Address, Command, PowerReport};
use crate::telemetry::{ConsolidatedTelemetry, UnitTelemetry};
use crate::{Error, Result};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Suffix of the consolidated topic.
pub const FLEET_TOPIC: &str = "pylon";

/// Destination of the published documents.
pub trait Publish {
    type Error: Display;

    fn publish(&mut self, topic: &str, payload: &str) -> std::result::Result<(), Self::Error>;
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Unit addresses, polled in this order.
    pub addresses: Vec<Address>,
    /// Timeout of the `info` and `pwr` exchanges.
    pub info_timeout: Duration,
    /// Timeout of the `bat` exchange.
    pub bat_timeout: Duration,
    pub topic_base: String,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            addresses: (1..=5).collect(),
            info_timeout: Duration::from_secs(10),
            bat_timeout: Duration::from_secs(20),
            topic_base: "victron-battery-middleware".to_string(),
        }
    }
}

impl PollSettings {
    pub fn unit_topic(&self, address: Address) -> String {
        format!("{}/battery_{address}", self.topic_base)
    }

    pub fn fleet_topic(&self) -> String {
        format!("{}/{FLEET_TOPIC}", self.topic_base)
    }

    fn timeout(&self, command: &Command) -> Duration {
        match command {
            Command::Battery(_) => self.bat_timeout,
            Command::Info(_) | Command::Power(_) => self.info_timeout,
        }
    }
}

/// Records produced by one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    /// One record per configured address, offline units included.
    pub units: Vec<(Address, UnitTelemetry)>,
    pub fleet: Option<ConsolidatedTelemetry>,
    /// Units that did not answer this cycle.
    pub offline: usize,
}

/// Polls all configured units over one link session.
pub struct Poller<P: Port> {
    link: LinkSession<P>,
    limits: FleetLimits,
    settings: PollSettings,
    cycles: u64,
    unit_errors: u64,
    started: Instant,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<P: Port> Poller<P> {
    pub fn new(link: LinkSession<P>, limits: FleetLimits, settings: PollSettings) -> Self {
        Self {
            link,
            limits,
            settings,
            cycles: 0,
            unit_errors: 0,
            started: Instant::now(),
            interrupt: None,
        }
    }

    /// Once `flag` is raised, the next exchange closes the link and fails
    /// with `Error::Interrupted`.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn limits(&self) -> &FleetLimits {
        &self.limits
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn link(&self) -> &LinkSession<P> {
        &self.link
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn unit_errors(&self) -> u64 {
        self.unit_errors
    }

    pub fn close(&mut self) {
        self.link.close();
    }

    /// Writes `command` and collects its response. An empty batch when the
    /// command could not be sent.
    fn exchange(&mut self, command: Command) -> Result<LineBatch> {
        if self.interrupted() {
            self.link.close();
            return Err(Error::Interrupted);
        }
        self.link.tracker().check()?;
        let request = command.request();
        if let Err(err) = self.link.write(&request) {
            log::warn!("{err}");
            return Ok(LineBatch::new());
        }
        let timeout = self.settings.timeout(&command);
        let lines = self
            .link
            .read_until(command.start_marker(&request), command.stop_marker(), timeout);
        Ok(lines)
    }

    /// Queries `info` of every configured unit and folds the reports into
    /// the fleet limits.
    pub fn learn_limits(&mut self) -> Result<()> {
        for address in self.settings.addresses.clone() {
            let lines = self.exchange(Command::Info(address))?;
            if lines.is_empty() {
                log::warn!("No info response from unit {address}");
                continue;
            }
            let report = decode_info(&lines);
            if report.barcode.is_none() {
                log::warn!("Unit {address} did not report a barcode");
            }
            self.limits.learn(address, &report);
            log::info!(
                "Unit {address} ({}): MaxChargeCurrent {} A, MaxDischargeCurrent {} A, {} cells",
                self.limits.barcode(address),
                self.limits.max_charge_current(),
                self.limits.max_discharge_current(),
                self.limits.cell_count()
            );
        }
        Ok(())
    }

    /// Record of one unit, `None` when its `pwr` exchange yielded nothing
    /// usable.
    pub fn query_unit(&mut self, address: Address) -> Result<Option<UnitTelemetry>> {
        let lines = self.exchange(Command::Power(address))?;
        let power = decode_pwr(&lines);
        if power == PowerReport::default() {
            log::warn!(
                "No pwr data from unit {address} ({} lines)",
                lines.len()
            );
            return Ok(None);
        }

        let lines = self.exchange(Command::Battery(address))?;
        if lines.is_empty() {
            log::warn!("No bat response from unit {address}");
        }
        let cells = decode_bat(&lines);

        Ok(Some(policy::evaluate(address, &power, &cells, &self.limits)))
    }

    /// Polls every unit, publishes each record and the fleet record.
    ///
    /// Publish failures are logged and ignored. Fails when the link's
    /// failure tracker trips or the interrupt flag is raised, after closing
    /// the link.
    pub fn run_cycle<S: Publish>(&mut self, sink: &mut S) -> Result<CycleReport> {
        self.cycles += 1;
        log::info!(
            "Cycle {} (uptime {}s, unit errors {})",
            self.cycles,
            self.started.elapsed().as_secs(),
            self.unit_errors
        );

        let mut units = Vec::with_capacity(self.settings.addresses.len());
        let mut offline = 0;
        for address in self.settings.addresses.clone() {
            let record = match self.query_unit(address) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    offline += 1;
                    self.unit_errors += 1;
                    log::warn!(
                        "Unit {address} ({}) offline this cycle",
                        self.limits.barcode(address)
                    );
                    fleet::offline_record(&self.limits)
                }
                Err(Error::Interrupted) => {
                    log::info!("Cycle {} interrupted at unit {address}", self.cycles);
                    return Err(Error::Interrupted);
                }
                Err(err) => {
                    log::error!("{err}, closing link");
                    self.link.close();
                    return Err(err);
                }
            };
            let topic = self.settings.unit_topic(address);
            publish(sink, &topic, &record);
            units.push((address, record));
        }

        let records: Vec<UnitTelemetry> = units.iter().map(|(_, record)| record.clone()).collect();
        let fleet = fleet::consolidate(&records, &self.limits);
        if let Some(fleet) = &fleet {
            let topic = self.settings.fleet_topic();
            publish(sink, &topic, fleet);
        }

        Ok(CycleReport {
            cycle: self.cycles,
            units,
            fleet,
            offline,
        })
    }
}

fn publish<S: Publish>(sink: &mut S, topic: &str, record: &UnitTelemetry) {
    let payload = match serde_json::to_string(record) {
        Ok(payload) => payload,
        Err(err) => {
            log::error!("Cannot serialise record for {topic}: {err}");
            return;
        }
    };
    log::debug!("{topic}: {payload}");
    if let Err(err) = sink.publish(topic, &payload) {
        log::error!("Publish to {topic} failed: {err}");
    }
}
