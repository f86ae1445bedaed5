//! Byte-stream sessions over the shared memory window
//!
//! A session is an open handle with its own cursor. Reads and writes start at
//! the cursor and advance it by the number of bytes moved. There is no seek:
//! the only way to move the cursor is to transfer data.

use std::io;

use crate::controller::DeviceController;
use crate::Result;

/// An open handle on the device node
#[derive(Debug)]
pub struct Session<'a> {
    controller: &'a DeviceController,
    minor: u32,
    offset: u64,
}

impl<'a> Session<'a> {
    pub(crate) fn new(controller: &'a DeviceController, minor: u32) -> Self {
        Self {
            controller,
            minor,
            offset: 0,
        }
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Current cursor position
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to `len` bytes into `buf`
    ///
    /// # Returns
    /// Bytes read, `min(len, size - offset)`; 0 at or past the end
    ///
    /// # Errors
    /// - `Fault` if `buf` cannot hold the clamped length; cursor unchanged
    /// - `WindowUnavailable` while unbound, in strict mode
    pub fn read(&mut self, buf: &mut [u8], len: usize) -> Result<usize> {
        let count = self.controller.read_at(self.offset, buf, len)?;
        self.advance(count);
        Ok(count)
    }

    /// Write up to `len` bytes from `buf`
    ///
    /// # Errors
    /// Same as [`Session::read`]
    pub fn write(&mut self, buf: &[u8], len: usize) -> Result<usize> {
        let count = self.controller.write_at(self.offset, buf, len)?;
        self.advance(count);
        Ok(count)
    }

    /// Skip `count` bytes by reading them into a scratch buffer
    ///
    /// # Returns
    /// Bytes actually skipped; less than `count` at the end of the window
    pub fn skip(&mut self, mut count: u64) -> Result<u64> {
        let mut scratch = [0u8; 512];
        let mut skipped = 0;
        while count > 0 {
            let chunk = count.min(scratch.len() as u64) as usize;
            let moved = self.read(&mut scratch, chunk)?;
            if moved == 0 {
                break;
            }
            skipped += moved as u64;
            count -= moved as u64;
        }
        Ok(skipped)
    }

    /// Close the handle
    pub fn release(self) {
        log::debug!("releasing session at offset {}", self.offset);
    }

    fn advance(&mut self, count: usize) {
        self.offset = self.offset.saturating_add(count as u64);
    }
}

impl io::Read for Session<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        Session::read(self, buf, len).map_err(io::Error::from)
    }
}

impl io::Write for Session<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Session::write(self, buf, buf.len()).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::SessionError;
    use ivshmem_broker::PciAddress;
    use pci_platform::mock::{MockDevice, MockPlatform};
    use std::io::{Read, Write};
    use std::sync::Arc;

    fn bound() -> DeviceController {
        let address = PciAddress::new(0, 0, 4, 0);
        let platform = Arc::new(MockPlatform::new().with_device(MockDevice::ivshmem(address, 4096)));
        let controller = DeviceController::new(platform, DriverConfig::default());
        controller.probe(&address).unwrap();
        controller
    }

    #[test]
    fn test_cursor_advances() {
        let controller = bound();
        let mut session = controller.open(0).unwrap();
        assert_eq!(session.offset(), 0);

        assert_eq!(session.write(b"hello", 5).unwrap(), 5);
        assert_eq!(session.offset(), 5);
        assert_eq!(session.write(b"world!", 5).unwrap(), 5);
        assert_eq!(session.offset(), 10);

        let mut reader = controller.open(0).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(reader.read(&mut buf, 10).unwrap(), 10);
        assert_eq!(&buf, b"helloworld");
    }

    #[test]
    fn test_fault_leaves_cursor() {
        let controller = bound();
        let mut session = controller.open(0).unwrap();
        let mut buf = [0u8; 4];

        let err = session.read(&mut buf, 8).unwrap_err();
        assert!(matches!(err, SessionError::Fault { needed: 8, provided: 4 }));
        assert_eq!(session.offset(), 0);

        assert!(session.write(&buf, 8).is_err());
        assert_eq!(session.offset(), 0);
    }

    #[test]
    fn test_skip_to_end() {
        let controller = bound();
        let mut session = controller.open(0).unwrap();

        assert_eq!(session.skip(4090).unwrap(), 4090);
        assert_eq!(session.skip(100).unwrap(), 6);
        assert_eq!(session.offset(), 4096);
        assert_eq!(session.skip(1).unwrap(), 0);
    }

    #[test]
    fn test_io_traits() {
        let controller = bound();
        let mut writer = controller.open(0).unwrap();
        writer.write_all(b"stream").unwrap();
        writer.flush().unwrap();

        let mut reader = controller.open(0).unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents.len(), 4096);
        assert_eq!(&contents[..6], b"stream");
        assert_eq!(reader.offset(), 4096);
    }

    #[test]
    fn test_io_error_kind() {
        let err = io::Error::from(SessionError::WindowUnavailable);
        assert_eq!(err.raw_os_error(), None);
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
