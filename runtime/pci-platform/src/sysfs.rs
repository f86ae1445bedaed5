//! Linux sysfs backend
//!
//! Drives a PCI function from userspace through
//! `/sys/bus/pci/devices/<domain:bus:device.function>/`:
//!
//! | Attribute            | Use                                            |
//! |----------------------|------------------------------------------------|
//! | `vendor`, `device`   | identity (hex, `0x` prefixed)                  |
//! | `subsystem_*`        | identity                                       |
//! | `class`              | identity                                       |
//! | `resource`           | one `start end flags` line per BAR             |
//! | `enable`             | `1` / `0` toggles memory decoding              |
//! | `resourceN`          | mmap-able view of BAR N                        |
//! | `driver`             | symlink present when a kernel driver owns it   |
//!
//! There is no userspace equivalent of `pci_request_regions`, so claims are
//! kept per process and refused while a kernel driver is bound.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, PoisonError};

use memmap2::{MmapMut, MmapOptions};

use crate::{
    mapped_len, BarInfo, BarMapping, PciAddress, PciDeviceInfo, PciIdentity, PciPlatform,
    PlatformError, ResourceFlags, Result, PCI_NUM_BARS,
};

/// Default location of PCI device directories
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/pci/devices";

/// A `resourceN` file mapped into memory
#[derive(Debug)]
pub struct SysfsMapping {
    bar: u8,
    base: NonNull<u8>,
    map: MmapMut,
}

// SAFETY: the mmap is kept alive by `map`; mmap returns page-aligned memory.
unsafe impl Send for SysfsMapping {}
unsafe impl Sync for SysfsMapping {}
unsafe impl BarMapping for SysfsMapping {
    fn bar(&self) -> u8 {
        self.bar
    }

    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// sysfs-backed PCI bus
#[derive(Debug)]
pub struct SysfsPlatform {
    root: PathBuf,
    claims: Mutex<HashMap<PciAddress, String>>,
}

impl Default for SysfsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsPlatform {
    /// Use the standard sysfs location
    pub fn new() -> Self {
        Self::with_root(DEFAULT_SYSFS_ROOT)
    }

    /// Use an alternative device directory (containers, tests)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.root.join(address.to_string())
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<PciAddress, String>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_device(&self, address: PciAddress) -> Result<PciDeviceInfo> {
        let dir = self.device_dir(&address);
        if !dir.is_dir() {
            return Err(PlatformError::DeviceNotFound(address));
        }

        let identity = PciIdentity {
            vendor: read_hex(&dir.join("vendor"))? as u16,
            device: read_hex(&dir.join("device"))? as u16,
            subsystem_vendor: read_hex_or_zero(&dir.join("subsystem_vendor"))? as u16,
            subsystem_device: read_hex_or_zero(&dir.join("subsystem_device"))? as u16,
            class: read_hex(&dir.join("class"))? as u32,
        };

        Ok(PciDeviceInfo {
            address,
            identity,
            bars: read_resources(&dir.join("resource"))?,
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PlatformError {
    PlatformError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_attr(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|value| value.trim().to_string())
        .map_err(|e| io_error(path, e))
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| io_error(path, e))
}

fn parse_hex(path: &Path, value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).map_err(|_| PlatformError::Malformed {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

fn read_hex(path: &Path) -> Result<u64> {
    let value = read_attr(path)?;
    parse_hex(path, &value)
}

fn read_hex_or_zero(path: &Path) -> Result<u64> {
    if path.exists() {
        read_hex(path)
    } else {
        Ok(0)
    }
}

/// Parse the `resource` attribute: the first six lines are the BARs
fn read_resources(path: &Path) -> Result<[Option<BarInfo>; PCI_NUM_BARS]> {
    let content = read_attr(path)?;
    let mut bars = [None; PCI_NUM_BARS];

    for (index, line) in content.lines().take(PCI_NUM_BARS).enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [start, end, flags] = fields.as_slice() else {
            return Err(PlatformError::Malformed {
                path: path.to_path_buf(),
                value: line.to_string(),
            });
        };

        let start = parse_hex(path, start)?;
        let end = parse_hex(path, end)?;
        let flags = parse_hex(path, flags)?;

        if end == 0 || end < start {
            continue;
        }

        bars[index] = Some(BarInfo {
            index: index as u8,
            start,
            len: end - start + 1,
            flags: ResourceFlags::from_bits_truncate(flags),
        });
    }

    Ok(bars)
}

impl PciPlatform for SysfsPlatform {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn enumerate(&self) -> Result<Vec<PciDeviceInfo>> {
        let entries = fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))?;
        let mut devices = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            let Some(address) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<PciAddress>().ok())
            else {
                continue;
            };

            match self.read_device(address) {
                Ok(info) => devices.push(info),
                Err(e) => log::warn!("sysfs: skipping {}: {}", address, e),
            }
        }

        devices.sort_by_key(|info| info.address);
        Ok(devices)
    }

    fn device_info(&self, address: &PciAddress) -> Result<PciDeviceInfo> {
        self.read_device(*address)
    }

    fn enable_device(&self, address: &PciAddress) -> Result<()> {
        write_attr(&self.device_dir(address).join("enable"), "1")
    }

    fn disable_device(&self, address: &PciAddress) {
        if let Err(e) = write_attr(&self.device_dir(address).join("enable"), "0") {
            log::warn!("sysfs: failed to disable {}: {}", address, e);
        }
    }

    fn request_regions(&self, address: &PciAddress, owner: &str) -> Result<()> {
        let dir = self.device_dir(address);
        if !dir.is_dir() {
            return Err(PlatformError::DeviceNotFound(*address));
        }

        let mut claims = self.claims();
        if let Some(current) = claims.get(address) {
            return Err(PlatformError::RegionsBusy {
                address: *address,
                owner: current.clone(),
            });
        }

        if let Ok(target) = fs::read_link(dir.join("driver")) {
            let driver = target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| target.display().to_string());
            return Err(PlatformError::RegionsBusy {
                address: *address,
                owner: driver,
            });
        }

        claims.insert(*address, owner.to_string());
        Ok(())
    }

    fn release_regions(&self, address: &PciAddress) {
        if self.claims().remove(address).is_none() {
            log::warn!("sysfs: releasing regions of {} which are not claimed", address);
        }
    }

    fn map_bar(&self, address: &PciAddress, bar: u8, max_len: usize) -> Result<Box<dyn BarMapping>> {
        let info = self.read_device(*address)?;
        let bar_info = info
            .bar(bar)
            .ok_or(PlatformError::BarNotPresent {
                address: *address,
                bar,
            })?;
        if !bar_info.is_memory() {
            return Err(PlatformError::NotMemory {
                address: *address,
                bar,
            });
        }

        let len = mapped_len(bar_info.len, max_len);
        let map_failed = || PlatformError::MapFailed {
            address: *address,
            bar,
            len,
        };
        let map_len = usize::try_from(len).map_err(|_| map_failed())?;
        if map_len == 0 {
            return Err(map_failed());
        }

        let path = self.device_dir(address).join(format!("resource{bar}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;

        // SAFETY: the file is a device resource; nothing in this process
        // truncates it while mapped.
        let mut map = unsafe { MmapOptions::new().len(map_len).map_mut(&file) }
            .map_err(|e| io_error(&path, e))?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(map_failed)?;

        log::debug!("sysfs: mapped {} ({} bytes)", path.display(), map_len);
        Ok(Box::new(SysfsMapping { bar, base, map }))
    }

    fn unmap_bar(&self, address: &PciAddress, mapping: Box<dyn BarMapping>) {
        log::debug!("sysfs: unmapping BAR {} of {}", mapping.bar(), address);
        drop(mapping);
    }
}
