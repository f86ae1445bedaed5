//! # PCI Platform Abstraction Layer
//!
//! This crate provides the bus-facing primitives a PCI driver needs during
//! probe and remove, behind one trait so the same binding logic runs against
//! different backends:
//! - **Mock Mode**: in-memory bus for fast unit testing, with fault injection
//! - **Sysfs Mode**: Linux userspace access through `/sys/bus/pci/devices`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pci_platform::{PciPlatform, PciAddress};
//!
//! let address: PciAddress = "0000:00:04.0".parse()?;
//! platform.enable_device(&address)?;
//! platform.request_regions(&address, "kvm_ivshmem")?;
//! let mapping = platform.map_bar(&address, 2, 0)?;
//! ```
//!
//! ## Build Modes
//!
//! ```bash
//! # Mock (default - testing)
//! cargo build
//!
//! # Sysfs (real devices on a Linux guest)
//! cargo build --features sysfs
//! ```

use std::fmt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "sysfs")]
pub mod sysfs;

/// Number of base address registers in a type 0 configuration header
pub const PCI_NUM_BARS: usize = 6;

/// Positive errno values reported through the bus hooks (negated on return)
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENXIO: i32 = 6;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
}

/// Platform error types
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("PCI device {0} not found")]
    DeviceNotFound(PciAddress),

    #[error("BAR {bar} of {address} is not present")]
    BarNotPresent { address: PciAddress, bar: u8 },

    #[error("BAR {bar} of {address} is not a memory resource")]
    NotMemory { address: PciAddress, bar: u8 },

    #[error("regions of {address} are already claimed by {owner}")]
    RegionsBusy { address: PciAddress, owner: String },

    #[error("cannot map BAR {bar} of {address} ({len} bytes)")]
    MapFailed { address: PciAddress, bar: u8, len: u64 },

    #[error("{operation} rejected for {address} (errno {errno})")]
    Rejected {
        address: PciAddress,
        operation: &'static str,
        errno: i32,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed attribute {path}: {value:?}")]
    Malformed { path: PathBuf, value: String },
}

impl PlatformError {
    /// Negative errno equivalent of this error
    pub fn errno(&self) -> i32 {
        match self {
            PlatformError::DeviceNotFound(_) => -errno::ENODEV,
            PlatformError::BarNotPresent { .. } | PlatformError::NotMemory { .. } => -errno::EINVAL,
            PlatformError::RegionsBusy { .. } => -errno::EBUSY,
            PlatformError::MapFailed { .. } => -errno::ENOMEM,
            PlatformError::Rejected { errno: code, .. } => {
                code.checked_abs().map_or(-errno::EIO, |code| -code)
            }
            PlatformError::Io { source, .. } => -source.raw_os_error().unwrap_or(errno::EIO),
            PlatformError::Malformed { .. } => -errno::EIO,
        }
    }
}

pub type Result<T> = core::result::Result<T, PlatformError>;

/// Bus location of a PCI function (`domain:bus:device.function`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Error returned when a PCI address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid PCI address {0:?} (expected [dddd:]bb:dd.f)")]
pub struct ParseAddressError(String);

impl FromStr for PciAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let err = || ParseAddressError(s.to_string());

        let (slot, function) = s.rsplit_once('.').ok_or_else(err)?;
        let mut parts = slot.rsplitn(3, ':');
        let device = parts.next().ok_or_else(err)?;
        let bus = parts.next().ok_or_else(err)?;
        let domain = parts.next().unwrap_or("0");

        let address = PciAddress {
            domain: u16::from_str_radix(domain, 16).map_err(|_| err())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| err())?,
            device: u8::from_str_radix(device, 16).map_err(|_| err())?,
            function: u8::from_str_radix(function, 16).map_err(|_| err())?,
        };

        if address.device > 0x1f || address.function > 7 {
            return Err(err());
        }

        Ok(address)
    }
}

/// Identity fields read from configuration space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciIdentity {
    pub vendor: u16,
    pub device: u16,
    pub subsystem_vendor: u16,
    pub subsystem_device: u16,
    /// Class code, programming interface in the low byte
    pub class: u32,
}

bitflags! {
    /// Resource flags as reported for each BAR
    ///
    /// Values follow the Linux `IORESOURCE_*` encoding used in the sysfs
    /// `resource` attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u64 {
        const IO = 0x0000_0100;
        const MEM = 0x0000_0200;
        const PREFETCH = 0x0000_2000;
        const MEM_64 = 0x0010_0000;
    }
}

/// One base address register as reported by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    pub index: u8,
    /// Bus address of the region
    pub start: u64,
    /// Length in bytes
    pub len: u64,
    pub flags: ResourceFlags,
}

impl BarInfo {
    pub fn is_memory(&self) -> bool {
        self.flags.contains(ResourceFlags::MEM)
    }
}

/// A function discovered on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub address: PciAddress,
    pub identity: PciIdentity,
    pub bars: [Option<BarInfo>; PCI_NUM_BARS],
}

impl PciDeviceInfo {
    /// Get a BAR by index, if the device implements it
    pub fn bar(&self, index: u8) -> Option<&BarInfo> {
        self.bars.get(index as usize).and_then(Option::as_ref)
    }
}

/// A live mapping of (part of) a BAR into this address space
///
/// # Safety
/// Implementors guarantee that `base()..base() + len()` stays valid for
/// volatile reads and writes until the mapping is dropped, and that `base()`
/// is aligned to at least 4 bytes.
pub unsafe trait BarMapping: Send + Sync + fmt::Debug {
    /// BAR index this mapping was created from
    fn bar(&self) -> u8;

    /// First mapped byte
    fn base(&self) -> NonNull<u8>;

    /// Mapped length in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bus primitives used while binding a driver to a device
///
/// Every acquire operation has an exact inverse; the inverses cannot fail
/// (failures are logged by the backend), matching the kernel's
/// `pci_disable_device` / `pci_release_regions` / `pci_iounmap`.
pub trait PciPlatform: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &'static str;

    /// List all functions on the bus
    fn enumerate(&self) -> Result<Vec<PciDeviceInfo>>;

    /// Look up a single function
    fn device_info(&self, address: &PciAddress) -> Result<PciDeviceInfo> {
        self.enumerate()?
            .into_iter()
            .find(|info| info.address == *address)
            .ok_or(PlatformError::DeviceNotFound(*address))
    }

    /// Wake up the device (enable memory decoding)
    fn enable_device(&self, address: &PciAddress) -> Result<()>;

    /// Inverse of [`PciPlatform::enable_device`]
    fn disable_device(&self, address: &PciAddress);

    /// Claim every region of the device exclusively for `owner`
    fn request_regions(&self, address: &PciAddress, owner: &str) -> Result<()>;

    /// Inverse of [`PciPlatform::request_regions`]
    fn release_regions(&self, address: &PciAddress);

    /// Map a memory BAR
    ///
    /// # Arguments
    /// * `bar` - BAR index
    /// * `max_len` - Upper bound on the mapped length; `0` maps the whole BAR
    fn map_bar(&self, address: &PciAddress, bar: u8, max_len: usize) -> Result<Box<dyn BarMapping>>;

    /// Inverse of [`PciPlatform::map_bar`]
    fn unmap_bar(&self, address: &PciAddress, mapping: Box<dyn BarMapping>);
}

/// Length `map_bar` should produce for a BAR of `bar_len` bytes
pub fn mapped_len(bar_len: u64, max_len: usize) -> u64 {
    if max_len == 0 {
        bar_len
    } else {
        bar_len.min(max_len as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let address: PciAddress = "0000:00:04.0".parse().unwrap();
        assert_eq!(address, PciAddress::new(0, 0, 4, 0));
        assert_eq!(address.to_string(), "0000:00:04.0");
    }

    #[test]
    fn test_address_without_domain() {
        let address: PciAddress = "01:1f.7".parse().unwrap();
        assert_eq!(address, PciAddress::new(0, 1, 0x1f, 7));
    }

    #[test]
    fn test_address_rejects_garbage() {
        assert!("".parse::<PciAddress>().is_err());
        assert!("00:04".parse::<PciAddress>().is_err());
        assert!("0000:00:20.0".parse::<PciAddress>().is_err());
        assert!("0000:00:04.8".parse::<PciAddress>().is_err());
        assert!("zz:00:04.0".parse::<PciAddress>().is_err());
    }

    #[test]
    fn test_mapped_len() {
        assert_eq!(mapped_len(4096, 0), 4096);
        assert_eq!(mapped_len(4096, 0x100), 0x100);
        assert_eq!(mapped_len(16, 0x100), 16);
    }

    #[test]
    fn test_errno_mapping() {
        let address = PciAddress::new(0, 0, 4, 0);
        assert_eq!(PlatformError::DeviceNotFound(address).errno(), -errno::ENODEV);
        assert_eq!(
            PlatformError::RegionsBusy {
                address,
                owner: "uio".into()
            }
            .errno(),
            -errno::EBUSY
        );
        assert_eq!(
            PlatformError::Rejected {
                address,
                operation: "enable",
                errno: -errno::EIO
            }
            .errno(),
            -errno::EIO
        );
        assert_eq!(
            PlatformError::Rejected {
                address,
                operation: "map",
                errno: errno::EBUSY
            }
            .errno(),
            -errno::EBUSY
        );

        // No positive counterpart
        assert_eq!(
            PlatformError::Rejected {
                address,
                operation: "enable",
                errno: i32::MIN
            }
            .errno(),
            -errno::EIO
        );
    }

    #[test]
    fn test_resource_flags() {
        let bar = BarInfo {
            index: 2,
            start: 0xfe00_0000,
            len: 0x40_0000,
            flags: ResourceFlags::MEM | ResourceFlags::PREFETCH | ResourceFlags::MEM_64,
        };
        assert!(bar.is_memory());
        assert!(!bar.flags.contains(ResourceFlags::IO));
    }
}
