#![forbid(unsafe_code)]

mod app;
mod config;
mod constants;
mod devices;
mod injection;
mod ipc;
mod mapping;
mod presets;
mod system_layout;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use app::AppContext;
use config::Config;
use config::settings::parse_log_level;
use constants::input::{EV_KEY, XKB_KEYCODE_OFFSET};
use devices::DeviceCatalog;
use injection::Launcher;
use injection::process::{ProcessLauncher, run_injector_process};
use injection::table::KeyEvent;
use injection::thread::ThreadLauncher;

/// How often a blocking apply checks for signals and exited workers
const WAIT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "key-mapper", version, about = "Remap keyboard keys per device")]
struct Cli {
    /// Configuration directory (default: ~/.config/key-mapper)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected keyboards
    ListDevices,

    /// List presets, most recently changed first
    ListPresets {
        #[arg(long)]
        device: Option<String>,
    },

    /// Create an empty preset
    CreatePreset {
        /// Defaults to a connected device that already has presets
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    RenamePreset {
        #[arg(long)]
        device: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    DeletePreset {
        #[arg(long)]
        device: String,
        #[arg(long)]
        name: String,
    },

    /// Print a preset's key mapping
    ShowPreset {
        #[arg(long)]
        device: String,
        /// Defaults to the newest preset, a new one is created if there is none
        #[arg(long)]
        preset: Option<String>,
    },

    /// Map a keycode to one or more symbols, or unmap it
    SetKey {
        #[arg(long)]
        device: String,
        #[arg(long)]
        preset: String,
        /// X keycode
        #[arg(long)]
        keycode: String,
        /// Symbol(s) to map to, none to unmap the key
        #[arg(long = "character")]
        characters: Vec<String>,
        /// Keycode this row had before, its entry is dropped
        #[arg(long)]
        previous: Option<String>,
    },

    /// Store a metadata value next to a preset's key mapping
    SetMetadata {
        #[arg(long)]
        device: String,
        #[arg(long)]
        preset: String,
        #[arg(long)]
        key: String,
        /// JSON, anything that doesn't parse is stored as a string
        #[arg(long)]
        value: String,
    },

    /// Remove every key mapping of a preset
    ClearPreset {
        #[arg(long)]
        device: String,
        #[arg(long)]
        preset: String,
    },

    /// Enable or disable applying a preset on startup
    Autoload {
        #[arg(long)]
        device: String,
        #[arg(long)]
        preset: String,
        #[arg(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
    },

    /// Inject a preset until interrupted
    Apply {
        #[arg(long)]
        device: String,
        /// Defaults to the device's newest preset
        #[arg(long)]
        preset: Option<String>,
        /// Run the injector on a thread instead of a child process
        #[arg(long)]
        in_process: bool,
        /// Print every injected key as `<X keycode>\t<value>`
        #[arg(long)]
        echo: bool,
    },

    /// Inject all autoloaded presets until interrupted
    StartAutoload {
        #[arg(long)]
        in_process: bool,
    },

    /// Worker process entry point
    #[command(hide = true)]
    Injector,
}

fn init_logging(level: Level) -> Result<()> {
    // stdout belongs to the injector IPC channel
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install logger")
}

/// `--debug`, then `LOG_LEVEL`, then the config file
fn log_level_name(cli: &Cli, config: &Config) -> String {
    if cli.debug {
        return "debug".to_string();
    }
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| config.log_level.clone())
}

fn scan_devices() -> DeviceCatalog {
    if !devices::check_permissions() {
        devices::print_permission_error();
        return DeviceCatalog::default();
    }
    devices::find_keyboards().unwrap_or_else(|e| {
        error!(error = %e, "Failed to enumerate devices");
        DeviceCatalog::default()
    })
}

fn launcher(in_process: bool, relay: bool, config: &Config, log_level: &str) -> Result<Box<dyn Launcher>> {
    let settings = &config.injection;
    if in_process {
        info!("Running injection in-process");
        return Ok(Box::new(ThreadLauncher::new(
            Box::new(devices::open_evdev),
            settings.relay_capacity,
        )));
    }
    Ok(Box::new(ProcessLauncher::new(
        relay,
        settings.relay_capacity,
        settings.start_timeout(),
        log_level,
    )?))
}

/// Print relayed key events for one `WAIT_INTERVAL`
fn print_events(relay: &Receiver<KeyEvent>) {
    let deadline = Instant::now() + WAIT_INTERVAL;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match relay.recv_timeout(left) {
            Ok(event) if event.kind == EV_KEY => {
                println!("{}\t{}", u32::from(event.code) + XKB_KEYCODE_OFFSET, event.value);
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(left);
                break;
            }
        }
    }
}

/// Block until SIGINT/SIGTERM or until every worker is gone
fn wait_for_shutdown(ctx: &mut AppContext, relay: Option<Receiver<KeyEvent>>) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("Failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("Failed to register SIGTERM handler")?;

    info!("Injecting, press Ctrl+C to stop");
    while !shutdown.load(Ordering::SeqCst) {
        if ctx.injector.running_devices().is_empty() {
            warn!("All injectors exited");
            return Ok(());
        }
        match &relay {
            Some(relay) => print_events(relay),
            None => std::thread::sleep(WAIT_INTERVAL),
        }
    }

    info!("Shutting down");
    ctx.injector.stop_all();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Injector = cli.command {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        init_logging(parse_log_level(&level))?;
        return run_injector_process().inspect_err(|e| error!(error = %e, "Injector failed"));
    }

    let config_dir = cli.config_dir.clone().unwrap_or_else(Config::default_dir);
    let config = Config::load_from(&Config::path_in(&config_dir))?;
    let level = log_level_name(&cli, &config);
    init_logging(parse_log_level(&level))?;
    info!(config_dir = %config_dir.display(), "Starting key-mapper");

    let in_process = match &cli.command {
        Command::Apply { in_process, .. } | Command::StartAutoload { in_process } => *in_process,
        _ => false,
    };
    let echo = matches!(cli.command, Command::Apply { echo: true, .. });
    let needs_devices = matches!(
        cli.command,
        Command::ListDevices
            | Command::CreatePreset { device: None, .. }
            | Command::Apply { .. }
            | Command::StartAutoload { .. }
    );
    let needs_layout = matches!(cli.command, Command::Apply { .. } | Command::StartAutoload { .. });

    let devices = if needs_devices { scan_devices() } else { DeviceCatalog::default() };
    let system_mapping = if needs_layout {
        system_layout::load()
    } else {
        mapping::Mapping::new()
    };
    let launcher = launcher(in_process, echo, &config, &level)?;
    let mut ctx = AppContext::new(&config_dir, config, devices, system_mapping, launcher);

    match cli.command {
        Command::ListDevices => {
            for device in ctx.known_devices() {
                println!("{device}");
            }
        }
        Command::ListPresets { device } => {
            let devices = match device {
                Some(device) => vec![device],
                None => ctx.store.list_devices(),
            };
            for device in devices {
                for preset in ctx.store.get_presets(&device) {
                    let marker = if ctx.config.is_autoloaded(&device, &preset) {
                        " (autoload)"
                    } else {
                        ""
                    };
                    println!("{device}\t{preset}{marker}");
                }
            }
        }
        Command::CreatePreset { device, name } => {
            let device = match device {
                Some(device) => device,
                None => match ctx.store.get_any_preset(&ctx.known_devices()) {
                    (Some(device), _) => device,
                    (None, _) => bail!("No keyboard found, pass --device"),
                },
            };
            let name = ctx.create_preset(&device, name.as_deref())?;
            println!("{name}");
        }
        Command::RenamePreset { device, from, to } => {
            match ctx.rename_preset(&device, &from, &to)? {
                Some(name) => println!("{name}"),
                None => bail!("Cannot rename {from:?} of {device:?} to {to:?}"),
            }
        }
        Command::DeletePreset { device, name } => {
            if !ctx.delete_preset(&device, &name)? {
                bail!("No preset {name:?} for {device:?}");
            }
        }
        Command::ShowPreset { device, preset } => {
            let preset = match preset {
                Some(preset) => match ctx.load_preset(&device, &preset) {
                    mapping::LoadOutcome::Loaded { .. } => preset,
                    outcome => bail!("Cannot read {preset:?} of {device:?}: {outcome:?}"),
                },
                None => ctx.select_device(&device)?,
            };
            println!("{device}\t{preset}");
            for (key, value) in ctx.custom_mapping.metadata() {
                println!("# {key} = {value}");
            }
            for (keycode, character) in &ctx.custom_mapping {
                println!("{keycode}\t{character}");
            }
        }
        Command::SetKey {
            device,
            preset,
            keycode,
            characters,
            previous,
        } => {
            match ctx.load_preset(&device, &preset) {
                mapping::LoadOutcome::Loaded { .. } => {}
                outcome => bail!("Cannot read {preset:?} of {device:?}: {outcome:?}"),
            }
            if characters.is_empty() {
                let Some(keycode) = mapping::ToKeycode::to_keycode(keycode.as_str()) else {
                    bail!("Invalid keycode {keycode:?}");
                };
                ctx.custom_mapping.clear(keycode);
            } else {
                let character: mapping::Character = match characters.len() {
                    1 => characters.concat().into(),
                    _ => characters.into(),
                };
                if !ctx
                    .custom_mapping
                    .change(keycode.as_str(), character, previous.as_deref())
                {
                    bail!("Invalid mapping for keycode {keycode:?}");
                }
            }
            if ctx.custom_mapping.changed {
                ctx.save_preset(&device, &preset, None)?;
            }
        }
        Command::SetMetadata {
            device,
            preset,
            key,
            value,
        } => {
            match ctx.load_preset(&device, &preset) {
                mapping::LoadOutcome::Loaded { .. } => {}
                outcome => bail!("Cannot read {preset:?} of {device:?}: {outcome:?}"),
            }
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            ctx.custom_mapping.set_metadata(key, value);
            if ctx.custom_mapping.changed {
                ctx.save_preset(&device, &preset, None)?;
            }
        }
        Command::ClearPreset { device, preset } => {
            match ctx.load_preset(&device, &preset) {
                mapping::LoadOutcome::Loaded { .. } => {}
                outcome => bail!("Cannot read {preset:?} of {device:?}: {outcome:?}"),
            }
            ctx.custom_mapping.empty();
            ctx.save_preset(&device, &preset, None)?;
        }
        Command::Autoload {
            device,
            preset,
            enable,
            disable: _,
        } => {
            ctx.set_autoload(&device, &preset, enable)?;
        }
        Command::Apply {
            device,
            preset,
            echo,
            ..
        } => {
            let preset = match preset {
                Some(preset) => preset,
                None => match ctx.store.find_newest_preset(&ctx.known_devices(), Some(&device)) {
                    (_, Some(preset)) => preset,
                    (_, None) => bail!("{device:?} has no presets"),
                },
            };
            ctx.apply_preset(&device, &preset)?;
            let relay = if echo { ctx.injector.take_relay(&device) } else { None };
            wait_for_shutdown(&mut ctx, relay)?;
        }
        Command::StartAutoload { .. } => {
            if ctx.start_autoload() == 0 {
                warn!("Nothing to autoload");
                return Ok(());
            }
            wait_for_shutdown(&mut ctx, None)?;
        }
        // ran before the config was loaded
        Command::Injector => {}
    }

    Ok(())
}
