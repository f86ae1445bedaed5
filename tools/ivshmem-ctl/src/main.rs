//! ivshmem-ctl - talk to an ivshmem device from a Linux guest
//!
//! Commands:
//! - `ivshmem-ctl list` - Show matching PCI functions and their BARs
//! - `ivshmem-ctl info` - Bind, print window geometry and registers
//! - `ivshmem-ctl read --offset N --len N [--hex]` - Dump shared memory
//! - `ivshmem-ctl write --offset N <data>` - Store bytes in shared memory
//!
//! Works through sysfs, so the device must not be bound to a kernel driver
//! and the caller needs write access to its `enable` and `resourceN` files.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use ivshmem_broker::{Binder, PciAddress, PciDeviceInfo, Register};
use ivshmem_driver::{attach, DeviceController, DriverConfig};
use pci_platform::sysfs::SysfsPlatform;
use pci_platform::PciPlatform;

#[derive(Parser)]
#[command(name = "ivshmem-ctl")]
#[command(version)]
#[command(about = "Inter-VM shared memory access tool", long_about = None)]
struct Cli {
    /// Driver configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// PCI device tree (overrides `sysfs_root`)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Device address, e.g. 0000:00:04.0 (default: first match)
    #[arg(short, long, global = true)]
    device: Option<PciAddress>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List ivshmem devices
    List,

    /// Bind the device and show its windows and registers
    Info,

    /// Read from shared memory
    Read {
        /// Start offset in bytes
        #[arg(short, long, default_value = "0", value_parser = parse_number)]
        offset: u64,

        /// Number of bytes to read
        #[arg(short, long, value_parser = parse_number)]
        len: u64,

        /// Print a hex dump instead of raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Write to shared memory
    Write {
        /// Start offset in bytes
        #[arg(short, long, default_value = "0", value_parser = parse_number)]
        offset: u64,

        /// Bytes to store
        data: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(root) = cli.root {
        config.sysfs_root = root;
    }

    log::debug!("using PCI device tree at {}", config.sysfs_root.display());
    let platform = Arc::new(SysfsPlatform::with_root(config.sysfs_root.clone()));

    match cli.command {
        Commands::List => {
            list_devices(platform)?;
        }

        Commands::Info => {
            let controller = bind(platform, config, cli.device)?;
            show_info(&controller)?;
            controller.remove();
        }

        Commands::Read { offset, len, hex } => {
            let controller = bind(platform, config, cli.device)?;
            let data = read_window(&controller, offset, len)?;
            controller.remove();

            if hex {
                print!("{}", hex_dump(offset, &data));
            } else {
                io::stdout().write_all(&data)?;
            }
        }

        Commands::Write { offset, data } => {
            let controller = bind(platform, config, cli.device)?;
            let written = write_window(&controller, offset, data.as_bytes())?;
            controller.remove();

            println!(
                "{} Wrote {} of {} bytes at {:#x}",
                "✅".green(),
                written,
                data.len(),
                offset
            );
        }
    }

    Ok(())
}

fn list_devices(platform: Arc<SysfsPlatform>) -> anyhow::Result<()> {
    let root = platform.root().display().to_string();
    let binder = Binder::new(platform);
    let devices = binder
        .discover()
        .with_context(|| format!("Failed to scan {}", root))?;

    if devices.is_empty() {
        println!("{} No ivshmem devices under {}", "⚠".yellow(), root);
        return Ok(());
    }

    for info in &devices {
        print_device(info);
    }
    Ok(())
}

fn print_device(info: &PciDeviceInfo) {
    let id = &info.identity;
    println!(
        "{} {:04x}:{:04x} (subsystem {:04x}:{:04x}, class {:06x})",
        info.address.to_string().bold().green(),
        id.vendor,
        id.device,
        id.subsystem_vendor,
        id.subsystem_device,
        id.class
    );
    for bar in info.bars.iter().flatten() {
        println!(
            "  BAR{} {:#014x} {:>10} bytes {:?}",
            bar.index, bar.start, bar.len, bar.flags
        );
    }
}

fn bind(
    platform: Arc<SysfsPlatform>,
    config: DriverConfig,
    device: Option<PciAddress>,
) -> anyhow::Result<DeviceController> {
    let controller = DeviceController::new(platform.clone(), config);
    match device {
        Some(address) => controller
            .probe(&address)
            .with_context(|| format!("Failed to bind {}", address))?,
        None => {
            attach(&controller, platform.as_ref() as &dyn PciPlatform)
                .context("Failed to bind an ivshmem device")?;
        }
    }
    Ok(controller)
}

fn show_info(controller: &DeviceController) -> anyhow::Result<()> {
    let config = controller.config();
    let shown = controller.with_instance(|device| {
        println!("{}", "IVSHMEM device".bold().green());
        println!("  Address:       {}", device.address());
        println!("  Driver:        {}", config.driver_name);
        println!("  Node:          {} (class {}, minor {})", config.device_name, config.class_name, config.minor);
        println!(
            "  Registers:     {:#x} ({} bytes)",
            device.registers().phys_base(),
            device.registers().size()
        );
        println!(
            "  Shared memory: {:#x} ({} bytes)",
            device.shared_window().phys_base(),
            device.shared_window().size()
        );

        println!("\n{}", "Registers".bold());
        for register in Register::ALL {
            if !inspectable(register) {
                println!("  {:<11} {}", register.name(), "(not read)".dimmed());
                continue;
            }
            println!("  {:<11} {:#010x}", register.name(), device.registers().read(register));
        }
    });
    shown.context("Device was removed before it could be inspected")
}

/// Whether reading `register` leaves the device untouched
///
/// Doorbell is write-only and InterruptStatus clears on read.
fn inspectable(register: Register) -> bool {
    !matches!(register, Register::Doorbell | Register::InterruptStatus)
}

fn read_window(controller: &DeviceController, offset: u64, len: u64) -> anyhow::Result<Vec<u8>> {
    let minor = controller.config().minor;
    let mut session = controller.open(minor)?;

    if session.skip(offset)? < offset {
        return Ok(Vec::new());
    }

    let available = controller
        .window_size()
        .map_or(0, |size| (size as u64).saturating_sub(offset));
    let len = usize::try_from(len.min(available)).context("Length does not fit in memory")?;
    let mut data = vec![0u8; len];
    let count = session.read(&mut data, len)?;
    data.truncate(count);
    session.release();
    Ok(data)
}

fn write_window(controller: &DeviceController, offset: u64, data: &[u8]) -> anyhow::Result<usize> {
    let minor = controller.config().minor;
    let mut session = controller.open(minor)?;

    if session.skip(offset)? < offset {
        return Ok(0);
    }

    let count = session.write(data, data.len())?;
    session.release();
    Ok(count)
}

/// Parse a decimal or `0x`-prefixed hexadecimal number
fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number `{}`: {}", s, e))
}

/// Classic 16-bytes-per-line dump, addresses relative to the window start
fn hex_dump(base: u64, data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let address = base + (line * 16) as u64;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:08x}  {:<47}  |{}|\n", address, hex.join(" "), ascii));
    }
    out
}
