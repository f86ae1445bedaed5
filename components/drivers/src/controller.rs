//! Device lifecycle controller
//!
//! Owns the single device instance slot and moves it between two states:
//!
//! ```text
//!            probe (bind ok)
//!   Unbound ----------------> Bound
//!      ^                        |
//!      +------------------------+
//!            remove (always)
//! ```
//!
//! The slot is a reader-writer lock around `Option<BoundDevice>`. Every
//! transfer holds the read side for the whole copy, so a call sees either
//! both windows or neither. `remove` takes the write side, which waits out
//! in-flight copies, and tears the device down before returning.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crossbeam::sync::ShardedLock;
use ivshmem_broker::{
    BindError, Binder, BoundDevice, PciAddress, PciPlatform, Register, SharedMemoryWindow,
};

use crate::config::{AccessDiscipline, DriverConfig, UnboundAccess};
use crate::session::Session;
use crate::{Result, SessionError};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unbound,
    Bound,
}

/// Owner of the device instance and entry point for sessions
pub struct DeviceController {
    binder: Binder,
    config: DriverConfig,
    instance: RwLock<Option<BoundDevice>>,
    /// Held around copies in [`AccessDiscipline::SingleWriter`] mode
    copy_lock: ShardedLock<()>,
}

impl DeviceController {
    /// Create an unbound controller
    pub fn new(platform: Arc<dyn PciPlatform>, config: DriverConfig) -> Self {
        let binder = Binder::new(platform).with_driver_name(config.driver_name.clone());
        Self {
            binder,
            config,
            instance: RwLock::new(None),
            copy_lock: ShardedLock::new(()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn binder(&self) -> &Binder {
        &self.binder
    }

    pub fn state(&self) -> LifecycleState {
        match *self.slot() {
            Some(_) => LifecycleState::Bound,
            None => LifecycleState::Unbound,
        }
    }

    /// Address of the bound device, if any
    pub fn bound_address(&self) -> Option<PciAddress> {
        self.slot().as_ref().map(|device| device.address())
    }

    /// Run `f` against the bound device
    ///
    /// `remove` blocks until `f` returns. `f` must not call back into the
    /// controller.
    ///
    /// # Returns
    /// `None` while unbound
    pub fn with_instance<R>(&self, f: impl FnOnce(&BoundDevice) -> R) -> Option<R> {
        self.slot().as_ref().map(f)
    }

    /// Bind the device at `address` and publish its windows
    ///
    /// # Errors
    /// - `AlreadyBound` if an instance is already published
    /// - any [`Binder::bind`] failure, after rollback
    pub fn probe(&self, address: &PciAddress) -> core::result::Result<(), BindError> {
        let mut slot = self.slot_mut();
        if let Some(current) = slot.as_ref() {
            log::warn!(
                "{}: device {} already bound, ignoring probe of {}",
                self.config.driver_name,
                current.address(),
                address
            );
            return Err(BindError::AlreadyBound(current.address()));
        }

        *slot = Some(self.binder.bind(address)?);
        Ok(())
    }

    /// Withdraw the published windows and release the device
    ///
    /// Always succeeds. Waits for in-flight transfers; once it returns the
    /// mappings are gone and the claim is released.
    pub fn remove(&self) {
        let mut slot = self.slot_mut();
        match slot.take() {
            Some(device) => device.unbind(),
            None => log::debug!("{}: remove while unbound", self.config.driver_name),
        }
    }

    /// Open a session on `minor`
    ///
    /// # Errors
    /// `NoSuchDevice` unless `minor` is the configured one
    pub fn open(&self, minor: u32) -> Result<Session<'_>> {
        log::debug!("Opening {} device", self.config.driver_name);
        if minor != self.config.minor {
            log::error!(
                "{}: minor number is {}, expected {}",
                self.config.driver_name,
                minor,
                self.config.minor
            );
            return Err(SessionError::NoSuchDevice {
                requested: minor,
                expected: self.config.minor,
            });
        }
        Ok(Session::new(self, minor))
    }

    /// Size of the bound shared memory window
    pub fn window_size(&self) -> Option<usize> {
        self.with_instance(|device| device.shared_window().size())
    }

    /// Read a device register
    ///
    /// # Errors
    /// `WindowUnavailable` while unbound
    pub fn read_register(&self, register: Register) -> Result<u32> {
        self.with_instance(|device| device.registers().read(register))
            .ok_or(SessionError::WindowUnavailable)
    }

    /// Write a device register
    ///
    /// # Errors
    /// `WindowUnavailable` while unbound
    pub fn write_register(&self, register: Register, value: u32) -> Result<()> {
        self.with_instance(|device| device.registers().write(register, value))
            .ok_or(SessionError::WindowUnavailable)
    }

    /// Copy up to `len` bytes at `offset` into `buf`
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8], len: usize) -> Result<usize> {
        let slot = self.slot();
        let Some(device) = slot.as_ref() else {
            log::error!("{}: Cannot read from unbound window", self.config.driver_name);
            return self.unbound_result();
        };
        let window = device.shared_window();
        let effective = checked_len(window, offset, len, buf.len())?;
        if effective == 0 {
            return Ok(0);
        }

        let _guard = match self.config.access {
            AccessDiscipline::SingleWriter => Some(
                self.copy_lock
                    .read()
                    .unwrap_or_else(PoisonError::into_inner),
            ),
            AccessDiscipline::Unsynchronized => None,
        };
        Ok(window.read_at(offset, &mut buf[..effective]))
    }

    /// Copy up to `len` bytes from `buf` to `offset`
    pub(crate) fn write_at(&self, offset: u64, buf: &[u8], len: usize) -> Result<usize> {
        let slot = self.slot();
        let Some(device) = slot.as_ref() else {
            log::error!("{}: Cannot write to unbound window", self.config.driver_name);
            return self.unbound_result();
        };
        let window = device.shared_window();
        let effective = checked_len(window, offset, len, buf.len())?;
        if effective == 0 {
            return Ok(0);
        }

        let _guard = match self.config.access {
            AccessDiscipline::SingleWriter => Some(
                self.copy_lock
                    .write()
                    .unwrap_or_else(PoisonError::into_inner),
            ),
            AccessDiscipline::Unsynchronized => None,
        };
        Ok(window.write_at(offset, &buf[..effective]))
    }

    fn unbound_result(&self) -> Result<usize> {
        match self.config.unbound_access {
            UnboundAccess::EmptyStream => Ok(0),
            UnboundAccess::Error => Err(SessionError::WindowUnavailable),
        }
    }

    fn slot(&self) -> RwLockReadGuard<'_, Option<BoundDevice>> {
        self.instance.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_mut(&self) -> RwLockWriteGuard<'_, Option<BoundDevice>> {
        self.instance.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceController")
            .field("config", &self.config)
            .field("instance", &*self.slot())
            .finish()
    }
}

/// Clamped transfer length, or `Fault` if the caller's buffer is shorter
fn checked_len(window: &SharedMemoryWindow, offset: u64, len: usize, provided: usize) -> Result<usize> {
    let effective = window.available(offset, len);
    if effective > provided {
        return Err(SessionError::Fault {
            needed: effective,
            provided,
        });
    }
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use pci_platform::mock::{MockDevice, MockPlatform};

    fn addr() -> PciAddress {
        PciAddress::new(0, 0, 4, 0)
    }

    fn controller(config: DriverConfig) -> (Arc<MockPlatform>, DeviceController) {
        let platform = Arc::new(MockPlatform::new().with_device(MockDevice::ivshmem(addr(), 4096)));
        let controller = DeviceController::new(platform.clone(), config);
        (platform, controller)
    }

    #[test]
    fn test_state_transitions() {
        let (platform, controller) = controller(DriverConfig::default());
        assert_eq!(controller.state(), LifecycleState::Unbound);
        assert_eq!(controller.window_size(), None);

        controller.probe(&addr()).unwrap();
        assert_eq!(controller.state(), LifecycleState::Bound);
        assert_eq!(controller.bound_address(), Some(addr()));
        assert_eq!(controller.window_size(), Some(4096));

        controller.remove();
        assert_eq!(controller.state(), LifecycleState::Unbound);
        assert!(!platform.holds_resources(&addr()));

        // remove while unbound is a no-op
        controller.remove();
        assert_eq!(controller.state(), LifecycleState::Unbound);
    }

    #[test]
    fn test_second_probe_rejected() {
        let (platform, controller) = controller(DriverConfig::default());
        controller.probe(&addr()).unwrap();

        let err = controller.probe(&addr()).unwrap_err();
        assert!(matches!(err, BindError::AlreadyBound(a) if a == addr()));
        assert_eq!(controller.state(), LifecycleState::Bound);
        assert_eq!(platform.live_mappings(&addr()), 2);
    }

    #[test]
    fn test_claim_uses_configured_driver_name() {
        let config = DriverConfig {
            driver_name: "ivshmem-test".to_string(),
            ..DriverConfig::default()
        };
        let (platform, controller) = controller(config);
        controller.probe(&addr()).unwrap();

        match platform.request_regions(&addr(), "other") {
            Err(pci_platform::PlatformError::RegionsBusy { owner, .. }) => {
                assert_eq!(owner, "ivshmem-test")
            }
            other => panic!("expected RegionsBusy, got {:?}", other),
        }
    }

    #[test]
    fn test_fault_when_buffer_short() {
        let (_platform, controller) = controller(DriverConfig::default());
        controller.probe(&addr()).unwrap();

        let mut buf = [0u8; 4];
        let err = controller.read_at(0, &mut buf, 10).unwrap_err();
        assert!(matches!(err, SessionError::Fault { needed: 10, provided: 4 }));

        // Clamped length fits the buffer
        assert_eq!(controller.read_at(4092, &mut buf, 10).unwrap(), 4);
        assert_eq!(controller.write_at(4096, &buf[..1], 10).unwrap(), 0);
    }

    #[test]
    fn test_registers_refused_while_unbound() {
        let (_platform, controller) = controller(DriverConfig::default());
        assert!(matches!(
            controller.read_register(Register::Position),
            Err(SessionError::WindowUnavailable)
        ));
        assert!(matches!(
            controller.write_register(Register::Doorbell, 1),
            Err(SessionError::WindowUnavailable)
        ));

        controller.probe(&addr()).unwrap();
        controller.write_register(Register::InterruptMask, 0xffff).unwrap();
        assert_eq!(controller.read_register(Register::InterruptMask).unwrap(), 0xffff);
    }

    #[test]
    fn test_remove_waits_for_instance_holder() {
        let (platform, controller) = controller(DriverConfig::default());
        controller.probe(&addr()).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|scope| {
            let controller = &controller;
            let holder = scope.spawn(move || {
                controller.with_instance(|device| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    device.shared_window().write_at(0, b"late")
                })
            });
            entered_rx.recv().unwrap();

            let remover = scope.spawn(move || controller.remove());
            thread::sleep(Duration::from_millis(50));
            assert!(!remover.is_finished());
            assert!(platform.is_claimed(&addr()));
            assert_eq!(platform.live_mappings(&addr()), 2);

            release_tx.send(()).unwrap();
            assert_eq!(holder.join().unwrap(), Some(4));
            remover.join().unwrap();
        });

        // Teardown finished inside remove, so the device can be bound again
        assert_eq!(controller.state(), LifecycleState::Unbound);
        assert!(!platform.holds_resources(&addr()));
        controller.probe(&addr()).unwrap();
        assert!(platform.is_enabled(&addr()));
        assert_eq!(platform.live_mappings(&addr()), 2);
    }

    /// Read with the copy lock held elsewhere; `None` if it did not finish in time
    fn read_under_held_copy_lock(access: AccessDiscipline, wait: Duration) -> Option<usize> {
        let config = DriverConfig {
            access,
            ..DriverConfig::default()
        };
        let (_platform, controller) = controller(config);
        controller.probe(&addr()).unwrap();

        let held = controller.copy_lock.write().unwrap();
        let (done_tx, done_rx) = mpsc::channel();
        thread::scope(|scope| {
            let controller = &controller;
            scope.spawn(move || {
                let mut buf = [0u8; 16];
                done_tx.send(controller.read_at(0, &mut buf, 16).unwrap()).unwrap();
            });

            let finished = done_rx.recv_timeout(wait).ok();
            drop(held);
            finished.or_else(|| {
                assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(16));
                None
            })
        })
    }

    #[test]
    fn test_unsynchronized_copies_skip_the_lock() {
        assert_eq!(
            read_under_held_copy_lock(AccessDiscipline::Unsynchronized, Duration::from_secs(5)),
            Some(16)
        );
    }

    #[test]
    fn test_single_writer_copies_wait_for_the_lock() {
        assert_eq!(
            read_under_held_copy_lock(AccessDiscipline::SingleWriter, Duration::from_millis(100)),
            None
        );
    }
}
