// SPDX-License-Identifier: MPL-2.0

//! Device contexts: the binding of a device's stream IDs to a domain.

use alloc::sync::{Arc, Weak};
use core::fmt::Debug;

use smallvec::SmallVec;
use spin::Mutex;

use crate::domain::SmmuDomain;

/// Number of device slots on a PCI bus.
pub const PCI_SLOTS_PER_BUS: u8 = 32;
/// Number of functions of a PCI device.
pub const PCI_FUNCTIONS_PER_SLOT: u8 = 8;

/// The location of a PCI function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PciDeviceLocation {
    pub bus: u8,
    /// Max 31
    pub device: u8,
    /// Max 7
    pub function: u8,
}

impl PciDeviceLocation {
    /// The requester ID of the function.
    pub fn rid(&self) -> u16 {
        ((self.bus as u16) << 8) | ((self.device as u16 & 0x1f) << 3) | (self.function as u16 & 0x7)
    }

    /// Every function location on `bus`.
    pub fn all_on_bus(bus: u8) -> impl Iterator<Item = PciDeviceLocation> {
        (0..PCI_SLOTS_PER_BUS).flat_map(move |device| {
            (0..PCI_FUNCTIONS_PER_SLOT).map(move |function| PciDeviceLocation {
                bus,
                device,
                function,
            })
        })
    }
}

/// The identity of a PCI function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PciDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

/// A device that issues DMA through an SMMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IommuDevice {
    /// A PCI function. A bus-wide device stands for every function of its
    /// bus, as a PCIe-to-PCI bridge does.
    Pci {
        location: PciDeviceLocation,
        id: PciDeviceId,
        buswide: bool,
    },
    /// A platform device with a fixed stream ID.
    Platform { stream_id: u32 },
}

impl IommuDevice {
    pub fn pci_id(&self) -> Option<PciDeviceId> {
        match self {
            IommuDevice::Pci { id, .. } => Some(*id),
            IommuDevice::Platform { .. } => None,
        }
    }
}

/// Translates PCI requester IDs to the stream IDs of one SMMU, as described
/// by the firmware (the IORT ID mappings or the device tree `iommu-map`).
pub trait StreamIdMap: Send + Sync {
    /// Returns the stream ID of `rid` behind this SMMU, if it has one.
    fn pci_stream_id(&self, rid: u16) -> Option<u32>;
}

/// The stream ID of a PCI function is its requester ID.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityStreamIdMap;

impl StreamIdMap for IdentityStreamIdMap {
    fn pci_stream_id(&self, rid: u16) -> Option<u32> {
        Some(rid as u32)
    }
}

pub(crate) type StreamIds = SmallVec<[u32; 1]>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ContextState {
    Created,
    /// The STEs of the listed stream IDs are programmed.
    Bound(StreamIds),
    Freed,
}

/// The binding of one device to a domain.
pub struct SmmuContext {
    device: IommuDevice,
    /// The stream ID of the device itself.
    sid: u32,
    bypass: bool,
    domain: Weak<SmmuDomain>,
    state: Mutex<ContextState>,
}

impl SmmuContext {
    pub(crate) fn new(device: IommuDevice, sid: u32, bypass: bool, domain: &Arc<SmmuDomain>) -> Self {
        Self {
            device,
            sid,
            bypass,
            domain: Arc::downgrade(domain),
            state: Mutex::new(ContextState::Created),
        }
    }

    pub fn device(&self) -> &IommuDevice {
        &self.device
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// Whether the device's traffic bypasses translation.
    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    pub fn domain(&self) -> Option<Arc<SmmuDomain>> {
        self.domain.upgrade()
    }

    pub fn is_bound(&self) -> bool {
        matches!(*self.state.lock(), ContextState::Bound(_))
    }

    pub fn is_freed(&self) -> bool {
        matches!(*self.state.lock(), ContextState::Freed)
    }

    /// Whether the context programs the STE of `sid`.
    pub fn covers_sid(&self, sid: u32) -> bool {
        Self::state_covers_sid(&self.state.lock(), self.sid, sid)
    }

    /// Like [`covers_sid`](Self::covers_sid), but returns `None` instead of
    /// waiting for a concurrent state change.
    pub(crate) fn try_covers_sid(&self, sid: u32) -> Option<bool> {
        let state = self.state.try_lock()?;
        Some(Self::state_covers_sid(&state, self.sid, sid))
    }

    fn state_covers_sid(state: &ContextState, own_sid: u32, sid: u32) -> bool {
        match state {
            ContextState::Bound(sids) => sids.contains(&sid),
            ContextState::Created => own_sid == sid,
            ContextState::Freed => false,
        }
    }

    /// The stream IDs whose STEs the context programmed.
    pub fn stream_ids(&self) -> StreamIds {
        match &*self.state.lock() {
            ContextState::Bound(sids) => sids.clone(),
            _ => StreamIds::new(),
        }
    }

    pub(crate) fn state(&self) -> spin::MutexGuard<'_, ContextState> {
        self.state.lock()
    }
}

impl Debug for SmmuContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuContext")
            .field("device", &self.device)
            .field("sid", &self.sid)
            .field("bypass", &self.bypass)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn requester_id() {
        let location = PciDeviceLocation {
            bus: 0x3,
            device: 0x1f,
            function: 0x5,
        };
        assert_eq!(location.rid(), 0x03fd);
    }

    #[test]
    fn bus_has_256_functions() {
        let rids: alloc::vec::Vec<u16> = PciDeviceLocation::all_on_bus(2).map(|l| l.rid()).collect();
        assert_eq!(rids.len(), 256);
        assert_eq!(rids[0], 0x200);
        assert_eq!(rids[255], 0x2ff);
    }
}
