use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use log::{error, info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::spawn;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::commands::CommandDispatcher;
use crate::device::connection::spawn_session;
use crate::device::types::{DeviceEvent, DeviceIdentity};
use crate::device::watcher::discover_first;
use crate::error::AppRunError;

pub mod config;
pub mod device;
pub mod error;

/// Keep a Pressensor pressure transducer connected and log its readings.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Args {
    /// Bluetooth address of the device; overrides (and updates) the configured one
    #[arg(long)]
    pub address: Option<String>,

    /// Path to the config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds to scan for a device when none is configured
    #[arg(long, default_value_t = 30)]
    pub discovery_timeout: u64,

    /// Log debug output
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn init_logging(level: log::LevelFilter) {
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

async fn log_events(mut events: Receiver<DeviceEvent>) {
    while let Some(event) = events.next().await {
        match event {
            DeviceEvent::StateChange(state) => info!("Pressensor is {}", state),
            DeviceEvent::Pressure(mbar) => info!("Pressure: {} mbar", mbar),
            DeviceEvent::Temperature(celsius) => info!("Temperature: {:.1} °C", celsius),
            DeviceEvent::Battery(percent) => info!("Battery: {}%", percent),
        }
    }
}

async fn resolve_identity(args: &Args, config_io: &ConfigIO, config: &mut Config, transport: &BtleTransport) -> Result<DeviceIdentity, AppRunError> {
    if let Some(address) = &args.address {
        let identity = DeviceIdentity::new(address, None);
        if config.address.as_deref() != Some(identity.address()) {
            config.bind(&identity);
            config_io.save(config).await?;
        }
        return Ok(identity);
    }

    if let Some(identity) = config.identity() {
        return Ok(identity);
    }

    let deadline = Duration::from_secs(args.discovery_timeout);
    info!("No device configured; scanning for {:?}", deadline);

    match discover_first(transport, deadline).await? {
        Some(identity) => {
            config.bind(&identity);
            config_io.save(config).await?;
            Ok(identity)
        },
        None => Err(AppRunError::DeviceNotFound(deadline)),
    }
}

async fn run_command(command: &str, dispatcher: &mut CommandDispatcher, config_io: &ConfigIO, config: &mut Config) {
    match command {
        "zero" => match dispatcher.send_zero_command().await {
            Ok(offset) => info!("Pressure zeroed (offset {} mbar)", offset),
            Err(err) => error!("{}", err),
        },
        "reconnect" => match dispatcher.reconnect().await {
            Ok(()) => info!("Pressensor is {}", dispatcher.settled_state().await),
            Err(err) => error!("{}", err),
        },
        "battery" => match dispatcher.read_battery().await {
            Ok(percent) => info!("Battery: {}%", percent),
            Err(err) => error!("{}", err),
        },
        "enable" | "disable" => {
            let enabled = command == "enable";
            if let Err(err) = dispatcher.set_connection_enabled(enabled).await {
                error!("{}", err);
                return;
            }

            config.connection_enabled = enabled;
            if let Err(err) = config_io.save(config).await {
                error!("Failed to save config: {}", err);
            }
        },
        "status" => match dispatcher.diagnostics().await {
            Ok(diagnostics) => match serde_json::to_string_pretty(&diagnostics) {
                Ok(json) => println!("{}", json),
                Err(err) => error!("Failed to format diagnostics: {}", err),
            },
            Err(err) => error!("{}", err),
        },
        "" => {},
        other => warn!("Unknown command {:?}", other),
    }
}

async fn command_loop(mut dispatcher: CommandDispatcher, config_io: &ConfigIO, config: &mut Config) -> Result<(), AppRunError> {
    let mut lines = BufReader::new(stdin()).lines();
    info!("Commands: zero, reconnect, battery, enable, disable, status, quit");

    loop {
        let line = tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                return Ok(());
            },
            line = lines.next_line() => line?,
        };

        match line {
            Some(line) if line.trim() == "quit" => return Ok(()),
            Some(line) => run_command(line.trim(), &mut dispatcher, config_io, config).await,
            None => {
                // stdin closed (e.g. running as a service); keep going until interrupted
                signal::ctrl_c().await?;
                return Ok(());
            },
        }
    }
}

pub async fn run(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(args.config.as_deref())?;
    let mut locker = config_io.locker()?;
    let _lock = locker.lock()?;

    let mut config = match config_io.read().await {
        Ok(config) => config,
        Err(err) if err.is_file_not_found_error() => Config::default(),
        Err(err) => return Err(err.into()),
    };

    let transport = Arc::new(BtleTransport::new().await?);
    let identity = resolve_identity(&args, &config_io, &mut config, &transport).await?;
    info!("Bound to {} {}", identity.address(), identity.name().unwrap_or(""));

    let cancel = CancellationToken::new();
    let (event_sender, event_receiver) = channel::<DeviceEvent>(64);
    let event_logger = spawn(log_events(event_receiver));

    let session = spawn_session(transport, identity, config.connection_enabled, vec![event_sender], cancel.clone());
    let result = command_loop(session.dispatcher.clone(), &config_io, &mut config).await;

    info!("Stopping");
    cancel.cancel();
    session.join().await;
    if let Err(err) = event_logger.await {
        warn!("Event logger task failed: {:?}", err);
    }

    result
}
