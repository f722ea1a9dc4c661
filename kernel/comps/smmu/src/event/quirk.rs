// SPDX-License-Identifier: MPL-2.0

//! Known-benign faults that are not reported.

use super::EventRecord;
use crate::context::PciDeviceId;

/// A fault that a specific device is known to raise harmlessly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventQuirk {
    pub vendor_id: u16,
    pub device_id: u16,
    pub event_id: u8,
    /// The faulting input address.
    pub addr: u64,
}

/// Realtek RTL8168 NICs read address zero after reset.
pub static EVENT_QUIRKS: &[EventQuirk] = &[EventQuirk {
    vendor_id: 0x10ec,
    device_id: 0x8168,
    event_id: 0x10,
    addr: 0x0,
}];

impl EventQuirk {
    pub fn matches(&self, device: PciDeviceId, event: &EventRecord) -> bool {
        self.vendor_id == device.vendor_id
            && self.device_id == device.device_id
            && self.event_id == event.id
            && self.addr == event.input_addr
    }
}

/// Whether `event`, raised by `device`, is a known-benign fault.
pub fn is_suppressed(device: Option<PciDeviceId>, event: &EventRecord) -> bool {
    let Some(device) = device else {
        return false;
    };
    EVENT_QUIRKS
        .iter()
        .any(|quirk| quirk.matches(device, event))
}

#[cfg(test)]
mod test {
    use super::*;

    const RTL8168: PciDeviceId = PciDeviceId {
        vendor_id: 0x10ec,
        device_id: 0x8168,
    };

    fn translation_fault(addr: u64) -> EventRecord {
        EventRecord::decode(&[0x0000_0100_0000_0010, 0, addr, 0])
    }

    #[test]
    fn exact_match_is_suppressed() {
        assert!(is_suppressed(Some(RTL8168), &translation_fault(0)));
    }

    #[test]
    fn any_differing_field_is_reported() {
        assert!(!is_suppressed(Some(RTL8168), &translation_fault(0x1000)));

        let other_vendor = PciDeviceId {
            vendor_id: 0x8086,
            ..RTL8168
        };
        assert!(!is_suppressed(Some(other_vendor), &translation_fault(0)));

        let other_device = PciDeviceId {
            device_id: 0x8169,
            ..RTL8168
        };
        assert!(!is_suppressed(Some(other_device), &translation_fault(0)));

        let permission_fault = EventRecord::decode(&[0x0000_0100_0000_0013, 0, 0, 0]);
        assert!(!is_suppressed(Some(RTL8168), &permission_fault));
    }

    #[test]
    fn unknown_device_is_reported() {
        assert!(!is_suppressed(None, &translation_fault(0)));
    }
}
