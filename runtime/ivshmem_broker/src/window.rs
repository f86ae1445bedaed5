//! Shared Memory Window - bounds-checked access to BAR2
//!
//! Every transfer is clamped against the window size before any pointer is
//! formed:
//!
//! ```text
//! avail     = size - offset        (0 if offset >= size)
//! effective = min(requested, avail)
//! ```
//!
//! A transfer at or past the end of the window moves zero bytes and is not an
//! error. The window performs no locking of its own: the memory is shared
//! with other VMs that cannot see any lock taken here, and concurrent local
//! writers race exactly as they would through the device node.

use core::ptr;

use pci_platform::BarMapping;

/// Mapped shared memory BAR
#[derive(Debug)]
pub struct SharedMemoryWindow {
    mapping: Box<dyn BarMapping>,
    phys_base: u64,
}

impl SharedMemoryWindow {
    pub(crate) fn new(mapping: Box<dyn BarMapping>, phys_base: u64) -> Self {
        Self { mapping, phys_base }
    }

    /// Bus address of BAR2
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Window size in bytes, as reported by the hardware resource length
    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    /// Number of bytes a transfer of `requested` bytes at `offset` may move
    pub fn available(&self, offset: u64, requested: usize) -> usize {
        let size = self.size() as u64;
        if offset >= size {
            return 0;
        }
        requested.min((size - offset) as usize)
    }

    /// Copy from the window into `buf`
    ///
    /// # Returns
    /// Bytes copied: `min(buf.len(), size - offset)`, or 0 past the end
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let len = self.available(offset, buf.len());
        if len == 0 {
            return 0;
        }

        // SAFETY: offset + len <= size by `available`; `buf` is a distinct
        // Rust allocation so the ranges cannot overlap
        unsafe {
            ptr::copy_nonoverlapping(self.ptr_at(offset), buf.as_mut_ptr(), len);
        }
        len
    }

    /// Copy `data` into the window
    ///
    /// # Returns
    /// Bytes copied: `min(data.len(), size - offset)`, or 0 past the end
    pub fn write_at(&self, offset: u64, data: &[u8]) -> usize {
        let len = self.available(offset, data.len());
        if len == 0 {
            return 0;
        }

        // SAFETY: see `read_at`
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr_at(offset), len);
        }
        len
    }

    /// # Safety
    /// `offset` must be below `size()`
    unsafe fn ptr_at(&self, offset: u64) -> *mut u8 {
        self.mapping.base().as_ptr().add(offset as usize)
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

    const SIZE: u64 = 4096;

    fn window() -> (MockPlatform, SharedMemoryWindow) {
        let address = PciAddress::new(0, 0, 4, 0);
        let platform = MockPlatform::new().with_device(MockDevice::ivshmem(address, SIZE));
        let mapping = platform.map_bar(&address, 2, 0).unwrap();
        (platform, SharedMemoryWindow::new(mapping, 0xfe00_0000))
    }

    #[test]
    fn test_clamp_table() {
        let (_platform, window) = window();
        let cases: &[(u64, usize, usize)] = &[
            (0, 10, 10),
            (0, 5000, 4096),
            (4090, 10, 6),
            (4095, 1, 1),
            (4096, 10, 0),
            (5000, 10, 0),
            (u64::MAX, usize::MAX, 0),
            (100, 0, 0),
        ];

        for &(offset, requested, expected) in cases {
            assert_eq!(
                window.available(offset, requested),
                expected,
                "offset {offset} requested {requested}"
            );
        }
    }

    #[test]
    fn test_round_trip() {
        let (_platform, window) = window();
        assert_eq!(window.write_at(0, b"helloworld"), 10);

        let mut buf = [0u8; 10];
        assert_eq!(window.read_at(0, &mut buf), 10);
        assert_eq!(&buf, b"helloworld");
    }

    #[test]
    fn test_tail_transfers_are_clamped() {
        let (platform, window) = window();
        let address = PciAddress::new(0, 0, 4, 0);

        assert_eq!(window.write_at(4090, b"0123456789"), 6);
        let bytes = platform.backing_bytes(&address, 2).unwrap();
        assert_eq!(&bytes[4090..], b"012345");

        let mut buf = [0u8; 10];
        assert_eq!(window.read_at(4090, &mut buf), 6);
        assert_eq!(&buf[..6], b"012345");
        assert_eq!(&buf[6..], &[0u8; 4]);

        assert_eq!(window.read_at(4096, &mut buf), 0);
        assert_eq!(window.write_at(1 << 40, b"x"), 0);
    }

    #[test]
    fn test_sees_peer_writes() {
        let (platform, window) = window();
        let address = PciAddress::new(0, 0, 4, 0);
        assert!(platform.write_backing(&address, 2, 128, b"from peer"));

        let mut buf = [0u8; 9];
        assert_eq!(window.read_at(128, &mut buf), 9);
        assert_eq!(&buf, b"from peer");
    }

    #[test]
    fn test_reports_geometry() {
        let (_platform, window) = window();
        assert_eq!(window.size(), SIZE as usize);
        assert_eq!(window.phys_base(), 0xfe00_0000);
    }
}
