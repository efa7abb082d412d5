use crate::config::Config;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Poll all units forever and publish the records
    Daemon {
        /// Pause between polling cycles, overrides `serial.reading_freq` (e.g., "2s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
        /// Print the records to the console instead of publishing them via MQTT
        #[clap(long, action)]
        console: bool,
    },
    /// Poll all units once, print every record as JSON and exit
    Once,
}

const fn about_text() -> &'static str {
    "battery bus poller and MQTT bridge"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Configuration file
    #[arg(short, long, default_value = Config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Serial port device path, overrides `serial.port` (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long)]
    pub device: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,
}
