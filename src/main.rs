//! `btwake`: wake or sleep a Bluetooth-controlled set-top box from the
//! command line.
//!
//! Each outcome has its own exit status so scripts and automations can tell
//! a pairing abort apart from a timeout or a missing Bluetooth stack.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use btwake::bluetooth::BackendKind;
use btwake::config::{default_config_path, AppConfig, LogLevel, SleepAction};
use btwake::controller::ControllerOutcome;
use btwake::logging::{configure_logging, set_debug_flags, DebugFlags};
use btwake::{DeviceAddress, DeviceInstance, WakeError};

#[derive(Parser, Debug)]
#[command(name = "btwake", version, about = "Wake and sleep a Bluetooth set-top box")]
struct Cli {
    /// Configuration file (defaults to <config dir>/btwake/device.json)
    #[arg(short, long, global = true, env = "BTWAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Device address, overrides the configured one
    #[arg(short, long, global = true, env = "BTWAKE_MAC")]
    mac: Option<String>,

    /// Backend: bluetoothctl or ble
    #[arg(short, long, global = true)]
    backend: Option<BackendKind>,

    /// error, warn, info, debug or trace. At debug or trace every category
    /// is shown unless --debug-category narrows it.
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Enable debug output for every category
    #[arg(long, global = true)]
    debug: bool,

    /// Enable debug output for some categories only:
    /// bluetooth, controller, monitor, config
    #[arg(long, global = true, value_delimiter = ',')]
    debug_category: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the wake sequence
    Wake,
    /// Put the device to sleep
    Sleep {
        /// disconnect (default) or power-off
        #[arg(long)]
        action: Option<SleepAction>,
    },
    /// Query the device once and print its state
    Status,
    /// Keep publishing the device state until interrupted
    Watch,
    /// Print a diagnostics report as JSON
    Diagnostics,
    /// Validate the configuration and print it
    CheckConfig,
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_path(path),
        None => AppConfig::load(),
    }
    .with_context(|| {
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        format!("Failed to load configuration from {}", path.display())
    })?;

    if let Some(mac) = &cli.mac {
        config.device.address = Some(DeviceAddress::parse(mac)?);
    }
    if let Some(backend) = cli.backend {
        config.device.backend = backend;
    }
    if let Some(level) = cli.log_level {
        config.system.log_level = level;
    }
    if let Some(file) = &cli.log_file {
        config.system.log_file = Some(file.clone());
    }
    Ok(config)
}

/// Backend failures at startup are reported with the matching outcome code
fn start_instance(config: btwake::DeviceConfig) -> anyhow::Result<Result<DeviceInstance, ExitCode>> {
    match DeviceInstance::start(config, None) {
        Ok(instance) => Ok(Ok(instance)),
        Err(WakeError::Backend(e)) => {
            let outcome = ControllerOutcome::from_error(e);
            eprintln!("{}", outcome);
            Ok(Err(exit_code(outcome.exit_code())))
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Err(e) = configure_logging(config.system.log_level, config.system.log_file.clone(), true) {
        eprintln!("{}", e);
    }
    let mut flags = if cli.debug { DebugFlags::all() } else { DebugFlags::default() };
    for category in &cli.debug_category {
        flags.enable(category).map_err(anyhow::Error::msg)?;
    }
    // a debug level with no category chosen means every category
    if flags == DebugFlags::default() && matches!(config.system.log_level, LogLevel::Debug | LogLevel::Trace) {
        flags = DebugFlags::all();
    }
    set_debug_flags(flags);

    let mut device = config.device.clone();
    if !matches!(cli.command, Command::Watch) {
        // one-shot commands must not race a background poller
        device.policy.polling_enabled = false;
        device.mirror_entity = None;
    }

    match cli.command {
        Command::CheckConfig => {
            device.policy.validate()?;
            let address = device.require_address()?;
            log::info!("Configuration valid for {}", address.masked());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Wake | Command::Sleep { .. } => {
            if let Command::Sleep { action: Some(action) } = cli.command {
                device.policy.sleep_action = action;
            }
            let mut instance = match start_instance(device)? {
                Ok(instance) => instance,
                Err(code) => return Ok(code),
            };
            let outcome = match cli.command {
                Command::Wake => instance.wake().await,
                _ => instance.sleep().await,
            };
            instance.shutdown().await;
            println!("{}", outcome);
            Ok(exit_code(outcome.exit_code()))
        }
        Command::Status => {
            let mut instance = match start_instance(device)? {
                Ok(instance) => instance,
                Err(code) => return Ok(code),
            };
            let result = instance.refresh().await;
            instance.shutdown().await;
            match result {
                Ok(state) => {
                    println!("{}", state);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    let outcome = ControllerOutcome::from_error(e);
                    eprintln!("{}", outcome);
                    Ok(exit_code(outcome.exit_code()))
                }
            }
        }
        Command::Watch => {
            if device.mirror_entity.is_none() {
                device.policy.polling_enabled = true;
            }
            let mut instance = match start_instance(device)? {
                Ok(instance) => instance,
                Err(code) => return Ok(code),
            };
            let mut states = instance.subscribe();
            println!("{}", *states.borrow_and_update());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        println!("{}", *states.borrow_and_update());
                    }
                }
            }
            instance.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Diagnostics => {
            let mut instance = match start_instance(device)? {
                Ok(instance) => instance,
                Err(code) => return Ok(code),
            };
            let report = instance.diagnostics();
            instance.shutdown().await;
            println!("{}", report.to_json()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
