use std::path::PathBuf;
use clap::{Parser};
use log::LevelFilter;

use crate::config::types::Config;

#[derive(Parser, Debug, Clone)]
#[command(author, version)]
#[command(about = "Connects to the inhaler sensor and prints its readings.\n\nType `start`, `stop`, `new`, `status` or `quit` followed by enter.", long_about = None)]
pub struct Args {
    /// Read settings from this file instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Advertised name of the peripheral to connect to
    #[arg(long)]
    pub device_name: Option<String>,

    /// How long to scan for the peripheral, in milliseconds
    #[arg(long)]
    pub scan_timeout: Option<u64>,

    /// Minimum level of log messages: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    pub log_level: LevelFilter,

    /// Do not take the single instance lock on the config file
    #[arg(long)]
    pub no_lock: bool,

    /// Use an in-process simulated peripheral instead of the bluetooth adapter
    #[arg(long)]
    pub simulate: bool,
}

impl Args {
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(device_name) = &self.device_name {
            config.device_name = device_name.clone();
        }
        if let Some(scan_timeout) = self.scan_timeout {
            config.scan_timeout_ms = scan_timeout;
        }
    }
}
