use std::env;
use std::sync::Arc;
use log::{error, info, LevelFilter};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::control::SessionControl;
use crate::device::events::EventBus;
use crate::device::session::SessionSettings;
use crate::device::simulated::SimulatedTransport;
use crate::error::AppRunError;
use crate::shell::args::Args;
use crate::shell::console::run_console;

pub mod device;
pub mod error;
pub mod config;
pub mod shell;

pub fn init_logging(level: LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", &err);
            }
            Config::default()
        }
    }
}

// feeds the simulated peripheral with readings that look like the real sensor's
fn simulated_readings(transport: SimulatedTransport, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick: u32 = 0;

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = sleep(Duration::from_millis(500)) => {
                    if transport.is_subscribed() {
                        let reading = 12.5 + (tick % 10) as f32 * 0.1;
                        transport.notify(format!("{:.1}", reading).as_bytes());
                        tick = tick.wrapping_add(1);
                    }
                },
            }
        }
    })
}

async fn run_async(args: Args) -> Result<(), AppRunError> {
    let mut config_io = match &args.config {
        Some(path) => ConfigIO::open(path)?,
        None => ConfigIO::new_sync()?,
    };

    let mut locker = config_io.locker()?;
    let _guard = match args.no_lock {
        true => None,
        false => Some(locker.lock()?),
    };

    let mut config = load_config(&config_io).await;
    args.apply_to(&mut config);
    info!("Looking for {:?}, scanning for {} ms", config.device_name, config.scan_timeout_ms);

    let cancel = CancellationToken::new();
    let events = EventBus::new(config.event_buffer);
    let settings = SessionSettings::from(&config);

    if args.simulate {
        let transport = SimulatedTransport::new();
        transport.advertise(&config.device_name, "00:00:00:00:00:00", Duration::from_millis(500));
        let readings = simulated_readings(transport.clone(), cancel.clone());

        run_console(SessionControl::new(Arc::new(transport), settings, events), cancel.clone()).await?;

        cancel.cancel();
        if let Err(err) = readings.await {
            error!("Simulated peripheral task failed: {}", err);
        }
    } else {
        let transport = BtleTransport::new(&config).await?;
        run_console(SessionControl::new(Arc::new(transport), settings, events), cancel).await?;
    }

    Ok(())
}

pub fn run(args: Args) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(args))
}
