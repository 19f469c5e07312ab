use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use yeelight_control_lib::config::{ConnectionConfig, ScannerConfig, DEFAULT_DEVICE_PORT};
use yeelight_control_lib::connection::Connection;
use yeelight_control_lib::device::device_map::{DeviceCache, DeviceMap, DeviceRegistry};
use yeelight_control_lib::device::{parse_device_id, Device, DeviceModel, SharedDevice};
use yeelight_control_lib::error::{ConnectionError, DiscoveryError};
use yeelight_control_lib::protocol::method::CronType;
use yeelight_control_lib::protocol::{Command, Effect, Prop, Reply};
use yeelight_control_lib::util::discovery::{pretty_print_devices, Scanner};
use yeelight_control_lib::util::traits::ConnectionListener;

/// Upper bound for waiting on a single reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_control",
    about = "Discovers and controls Yeelight smart lights on the local network",
    version = "0.1.0"
)]
pub struct Cli {
    /// YAML file with `connection` and `scanner` settings
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `discover` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the device
        #[clap(long)]
        ip: IpAddr,

        /// Sets the control port of the device
        #[clap(long, default_value_t = DEFAULT_DEVICE_PORT)]
        port: u16,

        /// Device id as printed by `discover`, only used in log output
        #[clap(long)]
        id: Option<String>,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Searches the local network for devices
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds, defaults to the configured scanner timeout
        #[clap(short = 't', long = "timeout")]
        timeout: Option<u64>,

        /// JSON file the device list is merged into and stored back to
        #[clap(long)]
        cache: Option<PathBuf>,
    },
    /// Prints device announcements until interrupted
    #[clap(name = "listen")]
    Listen,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum PowerState {
    On,
    Off,
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Toggles the main light.
    Toggle,
    /// Switches the main light on or off.
    Power {
        #[clap(value_enum)]
        state: PowerState,

        /// Transition time in milliseconds, 0 switches instantly
        #[clap(short, long, default_value_t = 500)]
        duration: u32,
    },
    /// Sets the brightness in percent.
    Bright {
        #[clap(value_parser = clap::value_parser!(u8).range(1..=100))]
        brightness: u8,

        #[clap(short, long, default_value_t = 500)]
        duration: u32,
    },
    /// Sets an RGB color.
    Rgb {
        /// Red component of the color (0-255)
        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: u8,

        /// Green component of the color (0-255)
        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: u8,

        /// Blue component of the color (0-255)
        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: u8,

        #[clap(short, long, default_value_t = 500)]
        duration: u32,
    },
    /// Sets the white color temperature in Kelvin.
    Ct {
        kelvin: u16,

        #[clap(short, long, default_value_t = 500)]
        duration: u32,
    },
    /// Sets a color by hue (0-359) and saturation (0-100).
    Hsv {
        hue: u16,

        saturation: u8,

        #[clap(short, long, default_value_t = 500)]
        duration: u32,
    },
    /// Renames the device.
    Name { name: String },
    /// Stores the current state as the power-on default.
    SetDefault,
    /// Stops a running color flow.
    StopFlow,
    /// Switches the light off after the given number of minutes.
    Sleep { minutes: u32 },
    /// Reads properties, all known ones when none are given.
    #[clap(name = "get-props")]
    GetProps { props: Vec<Prop> },
    /// Prints property notifications until interrupted or for a number of seconds.
    Watch {
        #[clap(short, long)]
        seconds: Option<u64>,
    },
}

/// Settings loaded from the `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Settings {
    connection: ConnectionConfig,
    scanner: ScannerConfig,
}

impl Settings {
    fn load(path: Option<&Path>) -> Result<Settings> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        serde_yaml::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Device list stored as a JSON array.
struct FileDeviceCache {
    path: PathBuf,
}

impl DeviceCache for FileDeviceCache {
    fn load_cached_devices(&self) -> Result<Option<DeviceMap>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open device cache {}", self.path.display()))?;
        let devices: Vec<Device> = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse device cache {}", self.path.display()))?;
        Ok(Some(devices.into_iter().collect()))
    }

    fn store_devices(&self, devices: &DeviceMap) -> Result<()> {
        let json = serde_json::to_string_pretty(&devices.sorted())?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write device cache {}", self.path.display()))
    }
}

/// Prints notifications and session changes of a watched device.
struct WatchPrinter;

impl ConnectionListener for WatchPrinter {
    fn on_disconnected(&self, device_id: u64, cause: Option<&ConnectionError>) {
        match cause {
            Some(cause) => println!("{:#x}: disconnected: {}", device_id, cause),
            None => println!("{:#x}: disconnected", device_id),
        }
    }

    fn on_response(&self, device_id: u64, reply: &Reply) {
        if let (true, Some(props)) = (reply.is_notification(), &reply.props) {
            let mut changes: Vec<String> = props
                .iter()
                .map(|(prop, value)| format!("{}={}", prop, value.to_wire()))
                .collect();
            changes.sort();
            println!("{:#x}: {}", device_id, changes.join(" "));
        }
    }
}

fn print_devices(devices: &DeviceMap, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext => {
            pretty_print_devices(devices);
        }
        OutputFormat::Json => {
            let json = serde_json::to_string(&devices.sorted())?;
            println!("{}", json);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&devices.sorted())?;
            println!("{}", yaml);
        }
    }
    Ok(())
}

fn build_command(id: u32, action: &DeviceAction) -> Result<Command> {
    let command = match action {
        DeviceAction::Toggle => Command::toggle(id),
        DeviceAction::Power { state, duration } => {
            Command::set_power(id, *state == PowerState::On, Effect::of(*duration))
        }
        DeviceAction::Bright {
            brightness,
            duration,
        } => Command::set_bright(id, *brightness, Effect::of(*duration)),
        DeviceAction::Rgb {
            red,
            green,
            blue,
            duration,
        } => {
            let rgb = (u32::from(*red) << 16) | (u32::from(*green) << 8) | u32::from(*blue);
            Command::set_rgb(id, rgb, Effect::of(*duration))
        }
        DeviceAction::Ct { kelvin, duration } => Command::set_ct(id, *kelvin, Effect::of(*duration)),
        DeviceAction::Hsv {
            hue,
            saturation,
            duration,
        } => Command::set_hsv(id, *hue, *saturation, Effect::of(*duration)),
        DeviceAction::Name { name } => Command::set_name(id, name),
        DeviceAction::SetDefault => Command::set_default(id),
        DeviceAction::StopFlow => Command::stop_flow(id),
        DeviceAction::Sleep { minutes } => Command::cron_add(id, CronType::PowerOff, *minutes),
        DeviceAction::GetProps { props } if props.is_empty() => Command::get_prop(id, &Prop::ALL),
        DeviceAction::GetProps { props } => Command::get_prop(id, props),
        DeviceAction::Watch { .. } => return Err(anyhow!("watch does not send a command")),
    };
    Ok(command)
}

fn print_reply(reply: &Reply) -> Result<()> {
    if reply.is_error() {
        return Err(anyhow!(
            "Device returned error {}: {}",
            reply.code,
            reply.message.as_deref().unwrap_or("unknown error")
        ));
    }
    match &reply.props {
        Some(props) => {
            let mut props: Vec<_> = props.iter().collect();
            props.sort_by_key(|(prop, _)| **prop);
            for (prop, value) in props {
                println!("{} = {}", prop, value.to_wire());
            }
        }
        None => println!("{}", serde_json::to_string(&reply.results)?),
    }
    Ok(())
}

async fn wait_for_interrupt(seconds: Option<u64>) -> Result<()> {
    match seconds {
        Some(seconds) => tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        },
        None => tokio::signal::ctrl_c().await?,
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Discover {
            output,
            timeout,
            cache,
        } => {
            let scanner = Scanner::new(settings.scanner, Handle::current());
            let devices = scanner
                .discover(timeout.map(Duration::from_millis))
                .await
                .ok_or(DiscoveryError::ScanInProgress)?;
            if let Some(e) = devices.error() {
                error!("Discovery failed: {}", e);
            }

            match cache.map(|path| FileDeviceCache { path }) {
                Some(cache) => {
                    let mut registry = match cache.load_cached_devices() {
                        Ok(Some(cached)) => DeviceRegistry::from_cache(cached),
                        Ok(None) => DeviceRegistry::new(),
                        Err(e) => {
                            warn!("Ignoring unreadable device cache: {:#}", e);
                            DeviceRegistry::new()
                        }
                    };
                    registry.merge_discovery(&devices);
                    let merged = registry.snapshot();
                    cache.store_devices(&merged)?;
                    print_devices(&merged, output)?;
                }
                None => print_devices(&devices, output)?,
            }
        }
        Commands::Listen => {
            let scanner = Scanner::new(settings.scanner, Handle::current());
            let address = scanner.listen(Arc::new(|device: Device| {
                println!("{}", device);
            }))?;
            println!("Listening for announcements on {}, press Ctrl-C to stop", address);
            wait_for_interrupt(None).await?;
            scanner.stop();
        }
        Commands::DeviceCall {
            ip,
            port,
            id,
            action,
        } => {
            let id = match id {
                Some(id) => parse_device_id(&id)?,
                None => 0,
            };
            let device = SharedDevice::new(Device::new(
                id,
                DeviceModel::Other("unknown".to_string()),
                ip,
                port,
            ));
            let connection = Connection::new(
                &device,
                settings.connection.clone(),
                Handle::current(),
            );
            connection
                .connect_and_wait()
                .await
                .with_context(|| format!("Failed to connect to {}:{}", ip, port))?;

            if let DeviceAction::Watch { seconds } = action {
                connection.set_listener(Some(Arc::new(WatchPrinter)));
                println!("Watching {}:{}, press Ctrl-C to stop", ip, port);
                wait_for_interrupt(seconds).await?;
                connection.disconnect();
                return Ok(());
            }

            let command = build_command(connection.next_command_id(), &action)?;
            let pending = connection.send(command)?;
            let reply = tokio::time::timeout(REPLY_TIMEOUT, pending)
                .await
                .map_err(|_| anyhow!("Device did not answer within {:?}", REPLY_TIMEOUT))??;
            connection.disconnect();
            print_reply(&reply)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_apply_connection_and_scanner_values() {
        let settings: Settings = serde_yaml::from_str(
            "connection:\n  connect_timeout_ms: 1500\nscanner:\n  default_timeout_ms: 800\n",
        )
        .unwrap();
        assert_eq!(settings.connection.connect_timeout(), Duration::from_millis(1500));
        assert_eq!(settings.scanner.default_timeout(), Duration::from_millis(800));
    }

    #[test]
    fn test_missing_settings_use_defaults() {
        let settings: Settings = serde_yaml::from_str("scanner:\n  buffer_size: 2048\n").unwrap();
        assert_eq!(settings.connection, ConnectionConfig::default());
        assert_eq!(settings.scanner.buffer_size, 2048);
    }
}
