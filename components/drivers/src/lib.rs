//! IVSHMEM Driver - shared memory as a byte stream
//!
//! # Purpose
//! Exposes the shared memory BAR of an ivshmem device as a seekless byte
//! stream. Bus events bind and unbind the device; any number of sessions
//! read and write the window through their own cursors.
//!
//! # Integration Points
//! - Depends on: `ivshmem-broker` (binding, windows), `pci-platform` (bus)
//! - Provides to: `ivshmem-ctl` and any host program embedding the driver
//! - Configuration: [`DriverConfig`] (TOML)
//!
//! # Architecture
//! - [`DeviceController`]: the single device instance slot and the
//!   `Unbound`/`Bound` state machine
//! - [`Session`]: an open handle with a private cursor
//! - [`PciDriver`]: the probe/remove hooks a bus calls, with [`attach`]
//!   walking the bus and probing matching devices
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use ivshmem_driver::{attach, DeviceController, DriverConfig};
//! use pci_platform::mock::{MockDevice, MockPlatform};
//! use pci_platform::PciAddress;
//!
//! let address = PciAddress::new(0, 0, 4, 0);
//! let platform = Arc::new(MockPlatform::new().with_device(MockDevice::ivshmem(address, 4096)));
//! let controller = DeviceController::new(platform.clone(), DriverConfig::default());
//! attach(&controller, platform.as_ref())?;
//!
//! let mut session = controller.open(0)?;
//! session.write(b"helloworld", 10)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Testing Strategy
//! - Unit tests: config parsing, cursor handling, fault detection
//! - Integration tests: end-to-end sessions on the mock bus, concurrent
//!   sessions, removal during transfers

pub mod config;
pub mod controller;
pub mod session;

use std::io;

use ivshmem_broker::{errno, match_id_table, BindError, DeviceMatch, PciAddress, PciPlatform};
use thiserror::Error;

pub use config::{AccessDiscipline, ConfigError, DriverConfig, UnboundAccess};
pub use controller::{DeviceController, LifecycleState};
pub use ivshmem_broker::{Register, IVSHMEM_ID_TABLE};
pub use session::Session;

/// Session error types
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no device with minor {requested} (driver serves minor {expected})")]
    NoSuchDevice { requested: u32, expected: u32 },

    #[error("buffer of {provided} bytes cannot hold a {needed}-byte transfer")]
    Fault { needed: usize, provided: usize },

    #[error("shared memory window is not mapped")]
    WindowUnavailable,
}

impl SessionError {
    /// Negative status reported to the caller
    pub fn errno(&self) -> i32 {
        match self {
            SessionError::NoSuchDevice { .. } => -errno::ENODEV,
            SessionError::Fault { .. } => -errno::EFAULT,
            SessionError::WindowUnavailable => -errno::ENXIO,
        }
    }
}

impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match err {
            SessionError::NoSuchDevice { .. } => io::ErrorKind::NotFound,
            SessionError::Fault { .. } => io::ErrorKind::InvalidInput,
            SessionError::WindowUnavailable => io::ErrorKind::NotConnected,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = core::result::Result<T, SessionError>;

/// Bus-facing hooks of a PCI driver
pub trait PciDriver {
    /// Name the driver registers under
    fn driver_name(&self) -> &str;

    /// Identities this driver handles
    fn id_table(&self) -> &'static [DeviceMatch];

    /// Take ownership of the device at `address`
    fn probe(&self, address: &PciAddress) -> core::result::Result<(), BindError>;

    /// Release the bound device; always succeeds
    fn remove(&self);

    /// [`PciDriver::probe`] as a bus status: 0 or a negative errno
    fn probe_status(&self, address: &PciAddress) -> i32 {
        match self.probe(address) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }
}

impl PciDriver for DeviceController {
    fn driver_name(&self) -> &str {
        &self.config().driver_name
    }

    fn id_table(&self) -> &'static [DeviceMatch] {
        IVSHMEM_ID_TABLE
    }

    fn probe(&self, address: &PciAddress) -> core::result::Result<(), BindError> {
        DeviceController::probe(self, address)
    }

    fn remove(&self) {
        DeviceController::remove(self)
    }
}

/// Probe every device on the bus that matches the driver's table
///
/// Stops at the first successful probe. Failed probes are logged and the
/// walk continues.
///
/// # Returns
/// Address of the bound device
///
/// # Errors
/// - `NoDevice` if nothing on the bus matches
/// - the last probe failure if every match failed
pub fn attach(
    driver: &dyn PciDriver,
    platform: &dyn PciPlatform,
) -> core::result::Result<PciAddress, BindError> {
    let mut last_error = None;

    for info in platform.enumerate()? {
        if match_id_table(driver.id_table(), &info.identity).is_none() {
            continue;
        }
        match driver.probe(&info.address) {
            Ok(()) => {
                log::info!(
                    "{}: Success to register pci driver on {}",
                    driver.driver_name(),
                    info.address
                );
                return Ok(info.address);
            }
            Err(e) => {
                log::warn!("{}: probe of {} failed: {}", driver.driver_name(), info.address, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(BindError::NoDevice {
        platform: platform.name(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_codes() {
        let no_device = SessionError::NoSuchDevice {
            requested: 1,
            expected: 0,
        };
        assert_eq!(no_device.errno(), -19);
        assert_eq!(
            SessionError::Fault {
                needed: 10,
                provided: 4
            }
            .errno(),
            -14
        );
        assert_eq!(SessionError::WindowUnavailable.errno(), -6);
    }

    #[test]
    fn test_io_error_carries_source() {
        let err = io::Error::from(SessionError::Fault {
            needed: 10,
            provided: 4,
        });
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("10-byte transfer"));
    }
}
