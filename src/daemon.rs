use crate::mqtt::MqttPublisher;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use pylonbus_lib::link::Port;
use pylonbus_lib::poller::{Poller, Publish};
use pylonbus_lib::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where the records of each cycle go.
pub enum Output {
    Mqtt(MqttPublisher),
    /// Print every record to the standard output with time and topic.
    Console,
    /// Print the bare JSON document of every record, one per line.
    Json,
    /// Records are computed and logged only.
    Disabled,
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Output::Mqtt(publisher) => write!(f, "Mqtt({})", publisher.topic_base()),
            Output::Console => write!(f, "Console"),
            Output::Json => write!(f, "Json"),
            Output::Disabled => write!(f, "Disabled"),
        }
    }
}

impl Output {
    /// Line printed for a record, `None` for outputs that do not print.
    fn render(&self, topic: &str, payload: &str) -> Option<String> {
        match self {
            Output::Console => Some(format!(
                "{} {topic}: {payload}",
                chrono::Local::now().to_rfc3339()
            )),
            Output::Json => Some(payload.to_string()),
            Output::Mqtt(_) | Output::Disabled => None,
        }
    }
}

impl Publish for Output {
    type Error = rumqttc::ClientError;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Self::Error> {
        if let Output::Mqtt(publisher) = self {
            return publisher.publish(topic, payload);
        }
        if let Some(line) = self.render(topic, payload) {
            println!("{line}");
        }
        Ok(())
    }
}

/// Sleeps for `duration` unless `stop` is raised first.
fn pause(duration: Duration, stop: &AtomicBool) {
    let until = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= until {
            break;
        }
        std::thread::sleep(STOP_POLL_INTERVAL.min(until - now));
    }
}

/// Polls until `stop` is raised or the link gives up.
pub fn run<P: Port>(
    mut poller: Poller<P>,
    mut output: Output,
    interval: Duration,
    stop: &AtomicBool,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");
    while !stop.load(Ordering::SeqCst) {
        let report = match poller.run_cycle(&mut output) {
            Ok(report) => report,
            Err(Error::Interrupted) => break,
            Err(err) => return Err(err).with_context(|| "Polling stopped"),
        };
        debug!(
            "Cycle {} done, {} of {} units offline",
            report.cycle,
            report.offline,
            report.units.len()
        );
        if report.offline == report.units.len() {
            warn!("No unit answered in cycle {}", report.cycle);
        }
        pause(interval, stop);
    }
    info!("Interrupted, closing serial link");
    poller.close();
    Ok(())
}

/// Runs a single cycle and prints the records as JSON.
pub fn once<P: Port>(mut poller: Poller<P>) -> Result<()> {
    let mut output = Output::Json;
    let result = poller.run_cycle(&mut output);
    poller.close();
    let report = match result {
        Ok(report) => report,
        Err(Error::Interrupted) => {
            info!("Interrupted");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| "Polling failed"),
    };
    info!(
        "{} of {} units answered",
        report.units.len() - report.offline,
        report.units.len()
    );
    Ok(())
}
