//! IVSHMEM Broker - PCI resource binding for the inter-VM shared memory device
//!
//! # Purpose
//! Discovers an ivshmem PCI function, takes ownership of its two memory
//! resources, and maps them: BAR0 as the 256-byte [`RegisterWindow`] and
//! BAR2 as the [`SharedMemoryWindow`] that backs all data traffic.
//!
//! # Integration Points
//! - Depends on: `pci-platform` (bus primitives)
//! - Provides to: `ivshmem-driver` (lifecycle controller, sessions)
//! - Resources held: device enable, region claim, two BAR mappings
//!
//! # Architecture
//! [`Binder::bind`] runs four acquire steps in order. A failure at any step
//! undoes the steps that already succeeded, newest first, so a failed bind
//! leaves nothing held:
//!
//! ```text
//! 1. enable device        -> ActivationFailed   (nothing to undo)
//! 2. request regions      -> ResourceBusy       (disable)
//! 3. map BAR2 (full len)  -> MapFailed          (release, disable)
//! 4. map BAR0 (256 bytes) -> MapFailed          (unmap BAR2, release, disable)
//! ```
//!
//! A successful bind yields a [`BoundDevice`] holding both windows. Dropping
//! it (or calling [`BoundDevice::unbind`]) unmaps BAR0, unmaps BAR2, releases
//! the claim and disables the device. Because the value is consumed, teardown
//! cannot run twice.
//!
//! # Testing Strategy
//! - Unit tests: identity matching, clamp arithmetic, register layout
//! - Integration tests: bind/unbind on the mock bus, fault injection at each step

mod identity;
mod mmio;
mod window;

use std::mem::ManuallyDrop;
use std::sync::Arc;

use static_assertions::assert_impl_all;
use thiserror::Error;

pub use identity::{
    match_id_table, DeviceMatch, IVSHMEM_DEVICE_ID, IVSHMEM_ID_TABLE, IVSHMEM_VENDOR_ID,
    PCI_ANY_ID,
};
pub use mmio::{Register, RegisterWindow, REGISTER_WINDOW_SIZE};
pub use pci_platform::{
    errno, BarInfo, PciAddress, PciDeviceInfo, PciIdentity, PciPlatform, PlatformError,
    ResourceFlags,
};
pub use window::SharedMemoryWindow;

/// BAR holding the register file
pub const REGISTER_BAR: u8 = 0;

/// BAR holding the shared memory object
pub const SHARED_MEMORY_BAR: u8 = 2;

/// Owner name recorded on the region claim
pub const DEFAULT_DRIVER_NAME: &str = "kvm_ivshmem";

/// Bind-time error types
#[derive(Debug, Error)]
pub enum BindError {
    #[error("device {address} ({vendor:04x}:{device:04x}) is not handled by this driver")]
    UnsupportedDevice {
        address: PciAddress,
        vendor: u16,
        device: u16,
    },

    #[error("no matching device on the {platform} bus")]
    NoDevice { platform: &'static str },

    #[error("device instance already bound to {0}")]
    AlreadyBound(PciAddress),

    #[error("unable to enable device {address}: {source}")]
    ActivationFailed {
        address: PciAddress,
        #[source]
        source: PlatformError,
    },

    #[error("cannot request regions of {address}: {source}")]
    ResourceBusy {
        address: PciAddress,
        #[source]
        source: PlatformError,
    },

    #[error("unable to map BAR {bar} of {address}: {source}")]
    MapFailed {
        address: PciAddress,
        bar: u8,
        #[source]
        source: PlatformError,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl BindError {
    /// Negative status reported to the bus
    ///
    /// Activation failures pass the platform's code through; every later
    /// acquire failure reports `-EBUSY`.
    pub fn errno(&self) -> i32 {
        match self {
            BindError::UnsupportedDevice { .. } | BindError::NoDevice { .. } => -errno::ENODEV,
            BindError::ActivationFailed { source, .. } => source.errno(),
            BindError::AlreadyBound(_)
            | BindError::ResourceBusy { .. }
            | BindError::MapFailed { .. } => -errno::EBUSY,
            BindError::Platform(source) => source.errno(),
        }
    }
}

pub type Result<T> = core::result::Result<T, BindError>;

/// Binds ivshmem devices found on a platform
pub struct Binder {
    platform: Arc<dyn PciPlatform>,
    driver_name: String,
}

impl Binder {
    /// Create a binder over a platform backend
    pub fn new(platform: Arc<dyn PciPlatform>) -> Self {
        Self {
            platform,
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
        }
    }

    /// Override the owner name recorded on region claims
    pub fn with_driver_name(mut self, name: impl Into<String>) -> Self {
        self.driver_name = name.into();
        self
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn platform(&self) -> &Arc<dyn PciPlatform> {
        &self.platform
    }

    /// All devices on the bus matching [`IVSHMEM_ID_TABLE`]
    pub fn discover(&self) -> Result<Vec<PciDeviceInfo>> {
        let devices = self.platform.enumerate()?;
        Ok(devices
            .into_iter()
            .filter(|info| match_id_table(IVSHMEM_ID_TABLE, &info.identity).is_some())
            .collect())
    }

    /// First matching device on the bus
    pub fn discover_first(&self) -> Result<PciDeviceInfo> {
        self.discover()?
            .into_iter()
            .next()
            .ok_or(BindError::NoDevice {
                platform: self.platform.name(),
            })
    }

    /// Acquire and map both resources of the device at `address`
    ///
    /// # Errors
    /// - `UnsupportedDevice` if the identity is not in the table
    /// - `ActivationFailed`, `ResourceBusy`, `MapFailed` from the acquire
    ///   steps; everything acquired before the failing step is released
    pub fn bind(&self, address: &PciAddress) -> Result<BoundDevice> {
        log::info!("{}: Probing for device {}", self.driver_name, address);

        let info = self.platform.device_info(address)?;
        if match_id_table(IVSHMEM_ID_TABLE, &info.identity).is_none() {
            return Err(BindError::UnsupportedDevice {
                address: *address,
                vendor: info.identity.vendor,
                device: info.identity.device,
            });
        }

        // Step 1: wake up the device
        if let Err(source) = self.platform.enable_device(address) {
            log::error!(
                "{}: Unable to probe device {}: error {}",
                self.driver_name,
                address,
                source.errno()
            );
            return Err(BindError::ActivationFailed {
                address: *address,
                source,
            });
        }

        // Step 2: claim every region for this driver
        if let Err(source) = self.platform.request_regions(address, &self.driver_name) {
            log::error!("{}: Cannot request regions of {}: {}", self.driver_name, address, source);
            self.platform.disable_device(address);
            return Err(BindError::ResourceBusy {
                address: *address,
                source,
            });
        }

        // Step 3: BAR2 maps the shared memory object
        let (shm_start, shm_len) = info
            .bar(SHARED_MEMORY_BAR)
            .map(|bar| (bar.start, bar.len))
            .unwrap_or_default();
        let shared = match self.platform.map_bar(address, SHARED_MEMORY_BAR, 0) {
            Ok(mapping) => SharedMemoryWindow::new(mapping, shm_start),
            Err(source) => {
                log::error!(
                    "{}: Unable to map shared memory region of size {}",
                    self.driver_name,
                    shm_len
                );
                self.platform.release_regions(address);
                self.platform.disable_device(address);
                return Err(BindError::MapFailed {
                    address: *address,
                    bar: SHARED_MEMORY_BAR,
                    source,
                });
            }
        };
        log::info!(
            "{}: shared memory at {:#x}, {} bytes",
            self.driver_name,
            shared.phys_base(),
            shared.size()
        );

        // Step 4: BAR0 holds the 256-byte register file
        let (reg_start, reg_len) = info
            .bar(REGISTER_BAR)
            .map(|bar| (bar.start, bar.len))
            .unwrap_or_default();
        let registers = self
            .platform
            .map_bar(address, REGISTER_BAR, REGISTER_WINDOW_SIZE)
            .and_then(|mapping| {
                RegisterWindow::new(mapping, reg_start).map_err(|short| {
                    let len = short.len() as u64;
                    self.platform.unmap_bar(address, short);
                    PlatformError::MapFailed {
                        address: *address,
                        bar: REGISTER_BAR,
                        len,
                    }
                })
            });
        let registers = match registers {
            Ok(registers) => registers,
            Err(source) => {
                log::error!(
                    "{}: Cannot map registers of size {}",
                    self.driver_name,
                    reg_len
                );
                self.platform.unmap_bar(address, shared.into_mapping());
                self.platform.release_regions(address);
                self.platform.disable_device(address);
                return Err(BindError::MapFailed {
                    address: *address,
                    bar: REGISTER_BAR,
                    source,
                });
            }
        };

        log::info!("{}: Finished probing device {}", self.driver_name, address);

        Ok(BoundDevice {
            address: *address,
            driver_name: self.driver_name.clone(),
            platform: Arc::clone(&self.platform),
            registers: ManuallyDrop::new(registers),
            shared: ManuallyDrop::new(shared),
        })
    }

    /// Release everything a successful [`Binder::bind`] acquired
    pub fn unbind(&self, device: BoundDevice) {
        device.unbind();
    }
}

/// A device with both windows mapped
///
/// Holds the only handle to the mappings and the region claim. Teardown runs
/// exactly once, when the value is dropped.
pub struct BoundDevice {
    address: PciAddress,
    driver_name: String,
    platform: Arc<dyn PciPlatform>,
    registers: ManuallyDrop<RegisterWindow>,
    shared: ManuallyDrop<SharedMemoryWindow>,
}

assert_impl_all!(BoundDevice: Send, Sync);
assert_impl_all!(SharedMemoryWindow: Send, Sync);
assert_impl_all!(RegisterWindow: Send, Sync);

impl BoundDevice {
    /// Bus address of the bound function
    pub fn address(&self) -> PciAddress {
        self.address
    }

    pub fn registers(&self) -> &RegisterWindow {
        &self.registers
    }

    pub fn shared_window(&self) -> &SharedMemoryWindow {
        &self.shared
    }

    /// Unmap both windows, release the claim, disable the device
    pub fn unbind(self) {
        drop(self);
    }
}

impl core::fmt::Debug for BoundDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BoundDevice")
            .field("address", &self.address)
            .field("platform", &self.platform.name())
            .field("registers", &*self.registers)
            .field("shared", &*self.shared)
            .finish()
    }
}

impl Drop for BoundDevice {
    fn drop(&mut self) {
        log::info!("{}: Unregister device {}", self.driver_name, self.address);

        // SAFETY: drop runs once and the fields are not touched afterwards
        let registers = unsafe { ManuallyDrop::take(&mut self.registers) };
        let shared = unsafe { ManuallyDrop::take(&mut self.shared) };

        self.platform.unmap_bar(&self.address, registers.into_mapping());
        self.platform.unmap_bar(&self.address, shared.into_mapping());
        self.platform.release_regions(&self.address);
        self.platform.disable_device(&self.address);
    }
}
