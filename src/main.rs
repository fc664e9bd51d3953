//! bklight - drive BK-Light LED matrix panels
//!
//! Sends still images or prebuffered animations to one panel or to a grid of
//! panels acting as one canvas.

use bklight_client::{discover_panels, Connector, DiscoveredDevice, LoopbackConnector, PanelBehavior};
use bklight_panels::config::DEFAULT_CONFIG_FILE;
use bklight_panels::{AppConfig, PanelManager};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::Colorize;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

/// Address used by `--simulate` when nothing is configured.
const SIMULATED_ADDRESS: &str = "00:00:00:00:B1:01";

/// Scan duration when neither `--timeout` nor the config gives a usable one.
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(6);

#[derive(Parser)]
#[command(name = "bklight")]
#[command(about = "Drive BK-Light LED matrix panels over Bluetooth Low Energy")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./config.yaml when present)
    #[arg(short, long, env = "BKLIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Single panel address, overriding the config file
    #[arg(short, long)]
    address: Option<String>,

    /// Use simulated in-process panels instead of Bluetooth
    #[arg(long)]
    simulate: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one image
    Send {
        /// Image file
        image: PathBuf,
    },

    /// Prebuffer a sequence of images and stream it
    Play {
        /// Image files, in playback order
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Frames per second (defaults to 1 / display.frame_interval)
        #[arg(long)]
        fps: Option<f64>,

        /// Number of passes over the sequence (0 loops until interrupted)
        #[arg(long, default_value_t = 1)]
        loops: u32,
    },

    /// Print the effective configuration
    Config,

    /// Scan for nearby panels and optionally store one in the config file
    Scan {
        /// Scan duration in seconds (defaults to device.scan_timeout)
        #[arg(long)]
        timeout: Option<f64>,

        /// Write the selected panel's address to the config file
        #[arg(long)]
        write: bool,

        /// Panel to select, by its position in the listing (1-based)
        #[arg(long)]
        select: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Some(address) = cli.address {
        config.device.address = Some(address);
        config.panels.list.clear();
        config.panels.layout = Default::default();
    }
    if cli.simulate && !config.is_multi_panel() && config.device.address().is_none() {
        config.device.address = Some(SIMULATED_ADDRESS.to_string());
    }
    config.normalize();

    if let Commands::Config = cli.command {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }
    if let Commands::Scan {
        timeout,
        write,
        select,
    } = cli.command
    {
        let secs = timeout.unwrap_or(config.device.scan_timeout);
        let timeout = Duration::try_from_secs_f64(secs).unwrap_or(DEFAULT_SCAN_TIMEOUT);
        println!("Scanning for BK-Light panels ({:.0}s)...", timeout.as_secs_f64());
        let devices = if cli.simulate {
            discover_panels(&simulated_panels(&config), timeout).await?
        } else {
            scan_ble(timeout).await?
        };
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        return scan(&devices, write, select, &config_path);
    }

    if cli.simulate {
        let connector = Arc::new(simulated_panels(&config));
        let result = run(&config, connector.clone(), cli.command).await;
        report_simulation(&config, &connector);
        return result;
    }
    run_ble(&config, cli.command).await
}

/// Lists discovered panels and, with `write`, stores the chosen one.
fn scan(
    devices: &[DiscoveredDevice],
    write: bool,
    select: Option<usize>,
    config_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if devices.is_empty() {
        eprintln!("{}", "No BK-Light panels found.".yellow());
        eprintln!("Make sure the panel is powered on and in range.");
        return Err("no panels found".into());
    }

    println!("Found {} panel(s):", devices.len());
    for (index, device) in devices.iter().enumerate() {
        println!(
            "  [{}] {}  ({})",
            index + 1,
            device.address.cyan(),
            device.name.as_deref().unwrap_or("unnamed")
        );
    }
    if !write {
        return Ok(());
    }

    let device = choose_device(devices, select)?;

    // Only the file's own content is rewritten, not env or CLI overrides
    let mut file_config = if config_path.exists() {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::default()
    };
    file_config.assign_device(&device.address);
    file_config.save(config_path)?;
    println!(
        "{} {} set to {}",
        "Updated".green(),
        config_path.display(),
        device.address
    );
    Ok(())
}

fn choose_device(
    devices: &[DiscoveredDevice],
    select: Option<usize>,
) -> Result<&DiscoveredDevice, String> {
    match (select, devices) {
        (Some(position), _) => devices
            .get(position.wrapping_sub(1))
            .ok_or_else(|| format!("--select must be between 1 and {}", devices.len())),
        (None, [only]) => Ok(only),
        (None, _) => Err("several panels found; choose one with --select".to_string()),
    }
}

#[cfg(feature = "ble")]
async fn scan_ble(timeout: Duration) -> Result<Vec<DiscoveredDevice>, Box<dyn std::error::Error>> {
    let connector = bklight_client::BleConnector::new().await?;
    Ok(discover_panels(&connector, timeout).await?)
}

#[cfg(not(feature = "ble"))]
async fn scan_ble(_timeout: Duration) -> Result<Vec<DiscoveredDevice>, Box<dyn std::error::Error>> {
    eprintln!(
        "{}: built without Bluetooth support; rebuild with `--features ble` or pass --simulate",
        "Error".red()
    );
    Err("Bluetooth support not compiled in".into())
}

#[cfg(feature = "ble")]
async fn run_ble(config: &AppConfig, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let connector = bklight_client::BleConnector::new().await?;
    run(config, Arc::new(connector), command).await
}

#[cfg(not(feature = "ble"))]
async fn run_ble(_config: &AppConfig, _command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "{}: built without Bluetooth support; rebuild with `--features ble` or pass --simulate",
        "Error".red()
    );
    Err("Bluetooth support not compiled in".into())
}

async fn run<C: Connector>(
    config: &AppConfig,
    connector: Arc<C>,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut manager = PanelManager::new(config, connector)?;
    let (width, height) = manager.canvas_size();
    tracing::info!(
        "Canvas {}x{} across {} panel(s)",
        width,
        height,
        manager.len()
    );

    // Decode and prebuffer before connecting, so bad input fails fast
    let job = match command {
        Commands::Send { image } => Job::Send(load_image(&image)?),
        Commands::Play { images, fps, loops } => {
            let images = images
                .iter()
                .map(|path| load_image(path))
                .collect::<Result<Vec<_>, _>>()?;
            let frames = manager.prebuffer_images(&images)?;
            tracing::info!("Prebuffered {} frame(s)", frames.len());
            let interval = playback_interval(fps, manager.frame_interval());
            Job::Play {
                frames,
                interval,
                loops,
            }
        }
        Commands::Config | Commands::Scan { .. } => return Ok(()),
    };

    let result = tokio::select! {
        result = drive(&mut manager, job) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}", "Interrupted, disconnecting...".dimmed());
            Ok(())
        }
    };
    manager.shutdown().await;

    if let Err(e) = &result {
        tracing::error!("{}", e);
    }
    result
}

enum Job {
    Send(RgbImage),
    Play {
        frames: Vec<Vec<Bytes>>,
        interval: Duration,
        loops: u32,
    },
}

async fn drive<C: Connector>(
    manager: &mut PanelManager<C>,
    job: Job,
) -> Result<(), Box<dyn std::error::Error>> {
    manager.connect().await?;

    match job {
        Job::Send(image) => {
            let stage_delay = manager.stage_delay();
            manager.send_image(&image, stage_delay).await?;
            println!("{} image", "Sent".green());
        }
        Job::Play {
            frames,
            interval,
            loops,
        } => {
            let mut pass = 0;
            while loops == 0 || pass < loops {
                pass += 1;
                for (index, frame) in frames.iter().enumerate() {
                    let started = Instant::now();
                    manager.send_prebuffered_streaming(frame).await?;
                    tracing::debug!("Frame {} sent in {:?}", index + 1, started.elapsed());
                    tokio::time::sleep_until(started + interval).await;
                }
            }
            println!(
                "{} {} frame(s) x {} pass(es)",
                "Played".green(),
                frames.len(),
                pass
            );
        }
    }
    Ok(())
}

/// Pause between frames: `1 / fps` when that is a usable duration, else
/// `fallback`.
fn playback_interval(fps: Option<f64>, fallback: Duration) -> Duration {
    fps.filter(|fps| *fps > 0.0)
        .and_then(|fps| Duration::try_from_secs_f64(1.0 / fps).ok())
        .unwrap_or(fallback)
}

fn load_image(path: &Path) -> Result<RgbImage, Box<dyn std::error::Error>> {
    let image = image::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    Ok(image.to_rgb8())
}

fn simulated_addresses(config: &AppConfig) -> Vec<String> {
    if config.is_multi_panel() {
        config
            .panels
            .descriptors()
            .into_iter()
            .map(|panel| panel.address)
            .collect()
    } else {
        config.device.address().map(str::to_string).into_iter().collect()
    }
}

fn simulated_panels(config: &AppConfig) -> LoopbackConnector {
    let connector = LoopbackConnector::new();
    for address in simulated_addresses(config) {
        // Counters only; a long playback must not accumulate payloads
        connector.add_panel(
            &address,
            PanelBehavior {
                capture_limit: 0,
                ..PanelBehavior::default()
            },
        );
    }
    connector
}

fn report_simulation(config: &AppConfig, connector: &LoopbackConnector) {
    for address in simulated_addresses(config) {
        let stats = connector.stats(&address);
        println!(
            "{} {}: {} connection(s), {} frame(s), {} payload bytes",
            "Simulated".cyan(),
            address,
            stats.connections,
            stats.frames_accepted,
            stats.payload_bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(address: &str, name: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            address: address.to_string(),
            name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_playback_interval() {
        let fallback = Duration::from_secs(5);
        assert_eq!(playback_interval(Some(4.0), fallback), Duration::from_millis(250));
        assert_eq!(playback_interval(None, fallback), fallback);
        assert_eq!(playback_interval(Some(0.0), fallback), fallback);
        assert_eq!(playback_interval(Some(-2.0), fallback), fallback);
        assert_eq!(playback_interval(Some(f64::NAN), fallback), fallback);
        // 1 / fps overflows a Duration
        assert_eq!(playback_interval(Some(1e-30), fallback), fallback);
    }

    #[test]
    fn test_choose_device() {
        let one = [device("AA", "LED_BLE_1")];
        assert_eq!(choose_device(&one, None).unwrap().address, "AA");

        let two = [device("AA", "LED_BLE_1"), device("BB", "LED_BLE_2")];
        assert!(choose_device(&two, None).is_err());
        assert_eq!(choose_device(&two, Some(2)).unwrap().address, "BB");
        assert!(choose_device(&two, Some(0)).is_err());
        assert!(choose_device(&two, Some(3)).is_err());
    }

    #[test]
    fn test_scan_writes_selected_address() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "display:\n  max_retries: 7\n").unwrap();

        let devices = [device("AA:BB:CC:DD:EE:01", "LED_BLE_1")];
        scan(&devices, true, None, &path).unwrap();

        let saved = AppConfig::from_file(&path).unwrap();
        assert_eq!(saved.device.address(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(saved.panels.descriptors()[0].address, "AA:BB:CC:DD:EE:01");
        // Existing settings survive
        assert_eq!(saved.display.max_retries, 7);
    }

    #[test]
    fn test_scan_without_write_leaves_config_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let devices = [device("AA", "LED_BLE_1"), device("BB", "LED_BLE_2")];
        scan(&devices, false, None, &path).unwrap();
        assert!(!path.exists());
        assert!(scan(&devices, true, None, &path).is_err());
        assert!(scan(&[], false, None, &path).is_err());
    }
}
