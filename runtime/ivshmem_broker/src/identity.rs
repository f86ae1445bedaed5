//! Device identity table
//!
//! Same matching rules as the kernel's `pci_match_one_device`: each field is
//! either an exact value or [`PCI_ANY_ID`], and the class is compared under
//! `class_mask`.

use pci_platform::PciIdentity;

/// Red Hat / virtio vendor ID
pub const IVSHMEM_VENDOR_ID: u16 = 0x1af4;

/// Inter-VM shared memory device ID (ivshmem-plain and ivshmem-doorbell)
pub const IVSHMEM_DEVICE_ID: u16 = 0x1110;

/// Wildcard for [`DeviceMatch`] fields
pub const PCI_ANY_ID: u32 = !0;

/// One entry of a driver's identity table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMatch {
    pub vendor: u32,
    pub device: u32,
    pub subvendor: u32,
    pub subdevice: u32,
    pub class: u32,
    pub class_mask: u32,
}

impl DeviceMatch {
    /// Match a (vendor, device) pair, any subsystem and class
    pub const fn device(vendor: u16, device: u16) -> Self {
        Self {
            vendor: vendor as u32,
            device: device as u32,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
            class: 0,
            class_mask: 0,
        }
    }

    /// Check whether a device identity satisfies this entry
    pub fn matches(&self, id: &PciIdentity) -> bool {
        field_matches(self.vendor, id.vendor)
            && field_matches(self.device, id.device)
            && field_matches(self.subvendor, id.subsystem_vendor)
            && field_matches(self.subdevice, id.subsystem_device)
            && (self.class ^ id.class) & self.class_mask == 0
    }
}

fn field_matches(wanted: u32, actual: u16) -> bool {
    wanted == PCI_ANY_ID || wanted == actual as u32
}

/// Devices this driver binds to
pub static IVSHMEM_ID_TABLE: &[DeviceMatch] =
    &[DeviceMatch::device(IVSHMEM_VENDOR_ID, IVSHMEM_DEVICE_ID)];

/// First table entry matching `id`
pub fn match_id_table<'a>(table: &'a [DeviceMatch], id: &PciIdentity) -> Option<&'a DeviceMatch> {
    table.iter().find(|entry| entry.matches(id))
}
