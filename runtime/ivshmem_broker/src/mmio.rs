//! Register Window - the ivshmem BAR0 register file
//!
//! BAR0 is a 256-byte MMIO region holding four 32-bit registers. Accesses
//! are volatile and fenced so neither the compiler nor the CPU can merge,
//! elide, or reorder them across calls.
//!
//! Interrupt delivery and doorbell signalling are not wired up; the
//! registers are mapped so the position ID can be read and future
//! notification support has somewhere to start.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

use pci_platform::BarMapping;
use static_assertions::const_assert;

/// Mapped length of the register BAR
pub const REGISTER_WINDOW_SIZE: usize = 0x100;

/// ivshmem registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Interrupt Mask
    InterruptMask,
    /// Interrupt Status
    InterruptStatus,
    /// VM ID of this peer
    Position,
    /// Doorbell (write-only)
    Doorbell,
}

impl Register {
    pub const ALL: [Register; 4] = [
        Register::InterruptMask,
        Register::InterruptStatus,
        Register::Position,
        Register::Doorbell,
    ];

    /// Byte offset within the register window
    pub const fn offset(self) -> usize {
        match self {
            Register::InterruptMask => 0x00,
            Register::InterruptStatus => 0x04,
            Register::Position => 0x08,
            Register::Doorbell => 0x0c,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Register::InterruptMask => "IntrMask",
            Register::InterruptStatus => "IntrStatus",
            Register::Position => "IVPosition",
            Register::Doorbell => "Doorbell",
        }
    }
}

/// Smallest mapping that covers every register
const REGISTER_SPAN: usize = Register::Doorbell.offset() + 4;

const_assert!(REGISTER_SPAN <= REGISTER_WINDOW_SIZE);
const_assert!(Register::InterruptStatus.offset() % 4 == 0);
const_assert!(Register::Position.offset() % 4 == 0);
const_assert!(Register::Doorbell.offset() % 4 == 0);

/// Mapped register BAR
#[derive(Debug)]
pub struct RegisterWindow {
    mapping: Box<dyn BarMapping>,
    phys_base: u64,
}

impl RegisterWindow {
    /// Wrap a BAR0 mapping
    ///
    /// Returns the mapping back if it is too short to hold every register.
    pub(crate) fn new(
        mapping: Box<dyn BarMapping>,
        phys_base: u64,
    ) -> core::result::Result<Self, Box<dyn BarMapping>> {
        if mapping.len() < REGISTER_SPAN {
            return Err(mapping);
        }
        Ok(Self { mapping, phys_base })
    }

    /// Bus address of BAR0
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Mapped length
    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    /// Read a register
    pub fn read(&self, register: Register) -> u32 {
        fence(Ordering::SeqCst);
        // SAFETY: offset is within REGISTER_SPAN (checked in `new`) and
        // 4-byte aligned on a mapping aligned to at least 4 bytes
        unsafe { read_volatile(self.register_ptr(register)) }
    }

    /// Write a register
    pub fn write(&self, register: Register, value: u32) {
        // SAFETY: see `read`
        unsafe { write_volatile(self.register_ptr(register), value) }
        fence(Ordering::SeqCst);
    }

    /// This peer's position (VM ID)
    pub fn position(&self) -> u32 {
        self.read(Register::Position)
    }

    fn register_ptr(&self, register: Register) -> *mut u32 {
        // SAFETY: offset < REGISTER_SPAN <= mapping.len()
        unsafe { self.mapping.base().as_ptr().add(register.offset()).cast::<u32>() }
    }

    pub(crate) fn into_mapping(self) -> Box<dyn BarMapping> {
        self.mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pci_platform::mock::{MockDevice, MockPlatform};
    use pci_platform::{PciAddress, PciPlatform};

    fn window() -> (MockPlatform, RegisterWindow) {
        let address = PciAddress::new(0, 0, 4, 0);
        let platform = MockPlatform::new().with_device(MockDevice::ivshmem(address, 4096));
        let mapping = platform.map_bar(&address, 0, REGISTER_WINDOW_SIZE).unwrap();
        let window = RegisterWindow::new(mapping, 0xfebf_1000).unwrap();
        (platform, window)
    }

    #[test]
    fn test_register_offsets() {
        let offsets: Vec<usize> = Register::ALL.iter().map(|r| r.offset()).collect();
        assert_eq!(offsets, vec![0x00, 0x04, 0x08, 0x0c]);
    }

    #[test]
    fn test_register_write_lands_at_offset() {
        let (platform, window) = window();
        window.write(Register::Doorbell, 0x0001_0002);
        window.write(Register::InterruptMask, 0xffff_ffff);

        let bytes = platform.backing_bytes(&PciAddress::new(0, 0, 4, 0), 0).unwrap();
        assert_eq!(&bytes[0x0c..0x10], &0x0001_0002u32.to_ne_bytes());
        assert_eq!(&bytes[0x00..0x04], &[0xff; 4]);
        assert_eq!(window.read(Register::InterruptMask), 0xffff_ffff);
    }

    #[test]
    fn test_position_reads_device_value() {
        let (platform, window) = window();
        let address = PciAddress::new(0, 0, 4, 0);
        assert!(platform.write_backing(&address, 0, 0x08, &3u32.to_ne_bytes()));
        assert_eq!(window.position(), 3);
    }

    #[test]
    fn test_short_mapping_rejected() {
        let address = PciAddress::new(0, 0, 4, 0);
        let platform = MockPlatform::new().with_device(MockDevice::ivshmem(address, 4096));
        let mapping = platform.map_bar(&address, 0, 8).unwrap();
        assert!(RegisterWindow::new(mapping, 0).is_err());
    }
}
