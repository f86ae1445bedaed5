//! Mock PCI bus for development and testing
//!
//! Devices are declared up front with their identity and BAR table. Memory
//! BARs are backed by page-aligned host allocations that outlive individual
//! mappings, the way the host-side shared memory object outlives a guest
//! driver binding. Every acquire step can be made to fail, and the bus keeps a
//! journal of what was acquired and released so tests can prove that a
//! rollback undid exactly what was done.

use std::alloc::{self, Layout};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    errno, mapped_len, BarInfo, BarMapping, PciAddress, PciDeviceInfo, PciIdentity, PciPlatform,
    PlatformError, ResourceFlags, Result, PCI_NUM_BARS,
};

/// Alignment of backing memory (one page, like a real mapping)
const BACKING_ALIGN: usize = 4096;

/// Acquire steps that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Enable,
    RequestRegions,
    MapBar(u8),
}

/// Journal entry recorded by the mock bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Enabled(PciAddress),
    Disabled(PciAddress),
    RegionsRequested(PciAddress),
    RegionsReleased(PciAddress),
    Mapped { address: PciAddress, bar: u8, len: usize },
    Unmapped { address: PciAddress, bar: u8 },
}

/// Declarative description of a mock device
#[derive(Debug, Clone)]
pub struct MockDevice {
    info: PciDeviceInfo,
}

impl MockDevice {
    /// Create a device with no BARs
    pub fn new(address: PciAddress, identity: PciIdentity) -> Self {
        Self {
            info: PciDeviceInfo {
                address,
                identity,
                bars: [None; PCI_NUM_BARS],
            },
        }
    }

    /// Layout of QEMU's `ivshmem-plain`: 256-byte register BAR0 and a
    /// prefetchable 64-bit shared memory BAR2 of `shmem_size` bytes
    pub fn ivshmem(address: PciAddress, shmem_size: u64) -> Self {
        let identity = PciIdentity {
            vendor: 0x1af4,
            device: 0x1110,
            subsystem_vendor: 0x1af4,
            subsystem_device: 0x1100,
            class: 0x05_00_00,
        };

        Self::new(address, identity)
            .with_bar(0, 0xfebf_1000, 0x100, ResourceFlags::MEM)
            .with_bar(
                2,
                0xfe00_0000,
                shmem_size,
                ResourceFlags::MEM | ResourceFlags::PREFETCH | ResourceFlags::MEM_64,
            )
    }

    /// Add or replace a BAR
    pub fn with_bar(mut self, index: u8, start: u64, len: u64, flags: ResourceFlags) -> Self {
        if let Some(slot) = self.info.bars.get_mut(index as usize) {
            *slot = Some(BarInfo {
                index,
                start,
                len,
                flags,
            });
        }
        self
    }

    /// Remove a BAR
    pub fn without_bar(mut self, index: u8) -> Self {
        if let Some(slot) = self.info.bars.get_mut(index as usize) {
            *slot = None;
        }
        self
    }

    pub fn info(&self) -> &PciDeviceInfo {
        &self.info
    }
}

/// Zeroed, page-aligned host memory behind one BAR
#[derive(Debug)]
struct BackingMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is plain bytes owned by this value; concurrent
// access goes through raw pointers exactly as it would for device memory.
unsafe impl Send for BackingMemory {}
unsafe impl Sync for BackingMemory {}

impl BackingMemory {
    fn allocate(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, BACKING_ALIGN).ok()?;
        // SAFETY: layout has non-zero size
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn snapshot(&self) -> Vec<u8> {
        // SAFETY: ptr is valid for layout.size() bytes
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()).to_vec() }
    }

    fn store(&self, offset: usize, data: &[u8]) -> bool {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.len() => {
                // SAFETY: range checked above
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
                }
                true
            }
            _ => false,
        }
    }
}

impl Drop for BackingMemory {
    fn drop(&mut self) {
        // SAFETY: allocated with the same layout in `allocate`
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Mapping handed out by [`MockPlatform::map_bar`]
#[derive(Debug)]
pub struct MockMapping {
    bar: u8,
    len: usize,
    backing: Arc<BackingMemory>,
}

// SAFETY: `backing` is kept alive by the Arc, is page aligned, and `len`
// never exceeds the allocation.
unsafe impl BarMapping for MockMapping {
    fn bar(&self) -> u8 {
        self.bar
    }

    fn base(&self) -> NonNull<u8> {
        self.backing.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[derive(Debug)]
struct DeviceSlot {
    info: PciDeviceInfo,
    backing: [Option<Arc<BackingMemory>>; PCI_NUM_BARS],
}

#[derive(Debug, Default)]
struct BusState {
    devices: Vec<DeviceSlot>,
    enabled: HashSet<PciAddress>,
    claims: HashMap<PciAddress, String>,
    live_mappings: HashMap<PciAddress, usize>,
    faults: HashSet<MockStep>,
    journal: Vec<MockEvent>,
}

impl BusState {
    fn slot(&self, address: &PciAddress) -> Result<&DeviceSlot> {
        self.devices
            .iter()
            .find(|slot| slot.info.address == *address)
            .ok_or(PlatformError::DeviceNotFound(*address))
    }

    fn slot_mut(&mut self, address: &PciAddress) -> Result<&mut DeviceSlot> {
        self.devices
            .iter_mut()
            .find(|slot| slot.info.address == *address)
            .ok_or(PlatformError::DeviceNotFound(*address))
    }
}

/// In-memory PCI bus
#[derive(Debug, Default)]
pub struct MockPlatform {
    state: Mutex<BusState>,
}

impl MockPlatform {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`MockPlatform::add_device`]
    pub fn with_device(self, device: MockDevice) -> Self {
        self.add_device(device);
        self
    }

    /// Hot-plug a device
    pub fn add_device(&self, device: MockDevice) {
        let mut state = self.state();
        state.devices.retain(|slot| slot.info.address != device.info.address);
        state.devices.push(DeviceSlot {
            info: device.info,
            backing: Default::default(),
        });
    }

    /// Make `step` fail on every subsequent attempt
    pub fn fail_at(&self, step: MockStep) {
        self.state().faults.insert(step);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    pub fn is_enabled(&self, address: &PciAddress) -> bool {
        self.state().enabled.contains(address)
    }

    pub fn is_claimed(&self, address: &PciAddress) -> bool {
        self.state().claims.contains_key(address)
    }

    /// Number of mappings currently outstanding for the device
    pub fn live_mappings(&self, address: &PciAddress) -> usize {
        self.state().live_mappings.get(address).copied().unwrap_or(0)
    }

    /// Whether the device holds any resource at all
    pub fn holds_resources(&self, address: &PciAddress) -> bool {
        self.is_enabled(address) || self.is_claimed(address) || self.live_mappings(address) > 0
    }

    /// Copy of the journal
    pub fn journal(&self) -> Vec<MockEvent> {
        self.state().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    /// Host-side view of a BAR's backing memory
    ///
    /// Returns `None` if the BAR has never been mapped.
    pub fn backing_bytes(&self, address: &PciAddress, bar: u8) -> Option<Vec<u8>> {
        let state = self.state();
        let slot = state.slot(address).ok()?;
        slot.backing.get(bar as usize)?.as_ref().map(|mem| mem.snapshot())
    }

    /// Write into a BAR's backing memory from the host side, as a peer VM
    /// sharing the same memory object would
    ///
    /// Returns `false` if the BAR has never been mapped or the range does not fit.
    pub fn write_backing(&self, address: &PciAddress, bar: u8, offset: usize, data: &[u8]) -> bool {
        let state = self.state();
        let Ok(slot) = state.slot(address) else {
            return false;
        };
        match slot.backing.get(bar as usize) {
            Some(Some(mem)) => mem.store(offset, data),
            _ => false,
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PciPlatform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn enumerate(&self) -> Result<Vec<PciDeviceInfo>> {
        Ok(self.state().devices.iter().map(|slot| slot.info.clone()).collect())
    }

    fn enable_device(&self, address: &PciAddress) -> Result<()> {
        let mut state = self.state();
        state.slot(address)?;

        if state.faults.contains(&MockStep::Enable) {
            return Err(PlatformError::Rejected {
                address: *address,
                operation: "enable",
                errno: -errno::EIO,
            });
        }

        state.enabled.insert(*address);
        state.journal.push(MockEvent::Enabled(*address));
        Ok(())
    }

    fn disable_device(&self, address: &PciAddress) {
        let mut state = self.state();
        if state.enabled.remove(address) {
            state.journal.push(MockEvent::Disabled(*address));
        } else {
            log::warn!("mock: disabling {} which is not enabled", address);
        }
    }

    fn request_regions(&self, address: &PciAddress, owner: &str) -> Result<()> {
        let mut state = self.state();
        state.slot(address)?;

        if state.faults.contains(&MockStep::RequestRegions) {
            return Err(PlatformError::RegionsBusy {
                address: *address,
                owner: "injected fault".to_string(),
            });
        }

        if let Some(current) = state.claims.get(address) {
            return Err(PlatformError::RegionsBusy {
                address: *address,
                owner: current.clone(),
            });
        }

        state.claims.insert(*address, owner.to_string());
        state.journal.push(MockEvent::RegionsRequested(*address));
        Ok(())
    }

    fn release_regions(&self, address: &PciAddress) {
        let mut state = self.state();
        if state.claims.remove(address).is_some() {
            state.journal.push(MockEvent::RegionsReleased(*address));
        } else {
            log::warn!("mock: releasing regions of {} which are not claimed", address);
        }
    }

    fn map_bar(&self, address: &PciAddress, bar: u8, max_len: usize) -> Result<Box<dyn BarMapping>> {
        let mut state = self.state();
        let fail = state.faults.contains(&MockStep::MapBar(bar));
        let slot = state.slot_mut(address)?;

        let info = *slot.info.bar(bar).ok_or(PlatformError::BarNotPresent {
            address: *address,
            bar,
        })?;
        if !info.is_memory() {
            return Err(PlatformError::NotMemory {
                address: *address,
                bar,
            });
        }

        let len = mapped_len(info.len, max_len);
        let map_failed = PlatformError::MapFailed {
            address: *address,
            bar,
            len,
        };
        if fail || len == 0 {
            return Err(map_failed);
        }

        let backing = match &slot.backing[bar as usize] {
            Some(mem) => Arc::clone(mem),
            None => {
                let full_len = usize::try_from(info.len).map_err(|_| map_failed)?;
                let mem = Arc::new(BackingMemory::allocate(full_len).ok_or(PlatformError::MapFailed {
                    address: *address,
                    bar,
                    len,
                })?);
                slot.backing[bar as usize] = Some(Arc::clone(&mem));
                mem
            }
        };

        let len = len as usize;
        *state.live_mappings.entry(*address).or_insert(0) += 1;
        state.journal.push(MockEvent::Mapped {
            address: *address,
            bar,
            len,
        });

        Ok(Box::new(MockMapping { bar, len, backing }))
    }

    fn unmap_bar(&self, address: &PciAddress, mapping: Box<dyn BarMapping>) {
        let bar = mapping.bar();
        drop(mapping);

        let mut state = self.state();
        match state.live_mappings.get_mut(address) {
            Some(count) if *count > 0 => {
                *count -= 1;
                state.journal.push(MockEvent::Unmapped {
                    address: *address,
                    bar,
                });
            }
            _ => log::warn!("mock: unmapping BAR {} of {} with no live mapping", bar, address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> PciAddress {
        PciAddress::new(0, 0, 4, 0)
    }

    fn bus() -> MockPlatform {
        MockPlatform::new().with_device(MockDevice::ivshmem(addr(), 4096))
    }

    #[test]
    fn test_enumerate_reports_bars() {
        let platform = bus();
        let devices = platform.enumerate().unwrap();
        assert_eq!(devices.len(), 1);

        let info = &devices[0];
        assert_eq!(info.identity.vendor, 0x1af4);
        assert_eq!(info.bar(0).unwrap().len, 0x100);
        assert_eq!(info.bar(2).unwrap().len, 4096);
        assert!(info.bar(1).is_none());
    }

    #[test]
    fn test_enable_and_claim_are_tracked() {
        let platform = bus();
        platform.enable_device(&addr()).unwrap();
        platform.request_regions(&addr(), "test").unwrap();
        assert!(platform.is_enabled(&addr()));
        assert!(platform.is_claimed(&addr()));

        platform.release_regions(&addr());
        platform.disable_device(&addr());
        assert!(!platform.holds_resources(&addr()));
    }

    #[test]
    fn test_double_claim_is_busy() {
        let platform = bus();
        platform.request_regions(&addr(), "first").unwrap();

        let err = platform.request_regions(&addr(), "second").unwrap_err();
        match err {
            PlatformError::RegionsBusy { owner, .. } => assert_eq!(owner, "first"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_map_honours_max_len() {
        let platform = bus();
        let mapping = platform.map_bar(&addr(), 2, 0x100).unwrap();
        assert_eq!(mapping.len(), 0x100);
        assert_eq!(mapping.base().as_ptr() as usize % BACKING_ALIGN, 0);
        assert_eq!(platform.live_mappings(&addr()), 1);

        platform.unmap_bar(&addr(), mapping);
        assert_eq!(platform.live_mappings(&addr()), 0);
    }

    #[test]
    fn test_backing_survives_unmap() {
        let platform = bus();
        let mapping = platform.map_bar(&addr(), 2, 0).unwrap();
        unsafe { mapping.base().as_ptr().write(0xab) };
        platform.unmap_bar(&addr(), mapping);

        assert_eq!(platform.backing_bytes(&addr(), 2).unwrap()[0], 0xab);
        assert!(platform.write_backing(&addr(), 2, 4095, &[0xcd]));
        assert!(!platform.write_backing(&addr(), 2, 4095, &[0, 0]));
    }

    #[test]
    fn test_injected_faults() {
        let platform = bus();
        platform.fail_at(MockStep::Enable);
        platform.fail_at(MockStep::MapBar(2));

        assert!(matches!(
            platform.enable_device(&addr()),
            Err(PlatformError::Rejected { .. })
        ));
        assert!(matches!(
            platform.map_bar(&addr(), 2, 0),
            Err(PlatformError::MapFailed { .. })
        ));
        assert!(platform.map_bar(&addr(), 0, 0x100).is_ok());

        platform.clear_faults();
        assert!(platform.enable_device(&addr()).is_ok());
    }

    #[test]
    fn test_io_bar_cannot_be_mapped() {
        let platform = MockPlatform::new().with_device(
            MockDevice::ivshmem(addr(), 4096).with_bar(1, 0xc000, 0x20, ResourceFlags::IO),
        );
        assert!(matches!(
            platform.map_bar(&addr(), 1, 0),
            Err(PlatformError::NotMemory { bar: 1, .. })
        ));
        assert!(matches!(
            platform.map_bar(&addr(), 4, 0),
            Err(PlatformError::BarNotPresent { bar: 4, .. })
        ));
    }

    #[test]
    fn test_unknown_device() {
        let platform = MockPlatform::new();
        assert!(matches!(
            platform.enable_device(&addr()),
            Err(PlatformError::DeviceNotFound(_))
        ));
    }
}
