use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::*;
use pylonbus_lib::breaker::FailureTracker;
use pylonbus_lib::limits::FleetLimits;
use pylonbus_lib::link::{serial_opener, LinkSession};
use pylonbus_lib::poller::Poller;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};
use config::{Config, LoggingConfig};

fn logging_init(loglevel: LevelFilter, config: &LoggingConfig) -> Result<LoggerHandle> {
    let mut logger =
        Logger::try_with_env_or_str(loglevel.as_str()).with_context(|| "Cannot init logging")?;
    if let Some(file_path) = &config.file_path {
        logger = logger
            .log_to_file(
                FileSpec::try_from(file_path)
                    .with_context(|| format!("Invalid log file path {file_path:?}"))?,
            )
            .rotate(
                Criterion::Size(config.file_max_size_kb * 1024),
                Naming::Numbers,
                Cleanup::KeepLogFiles(config.file_max_files),
            )
            .duplicate_to_stderr(Duplicate::All);
    }
    let log_handle = logger.start().with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

/// Raises the returned flag on Ctrl-C.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .with_context(|| "Cannot create signal runtime")?;
    let flag = stop.clone();
    std::thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Ctrl-C received, stopping");
                        flag.store(true, Ordering::SeqCst);
                    }
                    Err(err) => error!("Cannot listen for Ctrl-C: {err}"),
                }
            })
        })
        .with_context(|| "Cannot spawn signal thread")?;
    Ok(stop)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let loaded = Config::load_if_exists(&args.config)?;
    let found = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    if let Some(device) = args.device {
        config.serial.port = device;
    }

    let _log_handle = logging_init(args.verbose.log_level_filter(), &config.logging)?;
    if !found {
        warn!("Config file {:?} not found, using defaults", args.config);
    }
    debug!("Using config {config:?}");
    let stop = interrupt_flag()?;

    let link = LinkSession::initialize(
        serial_opener(config.serial.port.clone(), config.serial.timeout),
        config.link_settings(),
        FailureTracker::default(),
    )
    .with_context(|| format!("Cannot initialize serial link on '{}'", config.serial.port))?;

    let mut poller = Poller::new(
        link,
        FleetLimits::new(config.ceilings()),
        config.poll_settings(),
    );
    poller.set_interrupt(stop.clone());
    match poller.learn_limits() {
        Ok(()) => {}
        Err(pylonbus_lib::Error::Interrupted) => {
            info!("Interrupted during startup");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| "Cannot learn unit limits"),
    }

    match args.command {
        CliCommands::Daemon { interval, console } => {
            let output = if console {
                daemon::Output::Console
            } else if config.mqtt.active {
                daemon::Output::Mqtt(
                    mqtt::MqttPublisher::new(config.mqtt.clone())
                        .with_context(|| "Failed to create MQTT publisher")?,
                )
            } else {
                info!("MQTT publishing disabled");
                daemon::Output::Disabled
            };
            daemon::run(
                poller,
                output,
                interval.unwrap_or(config.serial.reading_freq),
                &stop,
            )
        }
        CliCommands::Once => daemon::once(poller),
    }
}
