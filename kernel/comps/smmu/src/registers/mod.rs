// SPDX-License-Identifier: MPL-2.0

//! The SMMUv3 register interface.
//!
//! Register page 0 holds the configuration registers; page 1 (at +64 KiB)
//! holds the event and page-request queue indexes.

mod control;
mod idr;

use core::{mem::size_of, ptr::NonNull};

pub use control::{Control0, Control1, Control2, GlobalError, IrqControl};
pub use idr::{SmmuFeatures, StallModel, TtEndian};
use log::error;
use volatile::VolatilePtr;

use crate::{error::Result, poll::poll_until};

pub const SMMU_IDR0: usize = 0x00;
pub const SMMU_IDR1: usize = 0x04;
pub const SMMU_IDR2: usize = 0x08;
pub const SMMU_IDR3: usize = 0x0c;
pub const SMMU_IDR4: usize = 0x10;
pub const SMMU_IDR5: usize = 0x14;
pub const SMMU_IIDR: usize = 0x18;
pub const SMMU_AIDR: usize = 0x1c;
pub const SMMU_CR0: usize = 0x20;
pub const SMMU_CR0ACK: usize = 0x24;
pub const SMMU_CR1: usize = 0x28;
pub const SMMU_CR2: usize = 0x2c;
pub const SMMU_STATUSR: usize = 0x40;
pub const SMMU_GBPA: usize = 0x44;
pub const SMMU_AGBPA: usize = 0x48;
pub const SMMU_IRQ_CTRL: usize = 0x50;
pub const SMMU_IRQ_CTRLACK: usize = 0x54;
pub const SMMU_GERROR: usize = 0x60;
pub const SMMU_GERRORN: usize = 0x64;
pub const SMMU_GERROR_IRQ_CFG0: usize = 0x68;
pub const SMMU_GERROR_IRQ_CFG1: usize = 0x70;
pub const SMMU_GERROR_IRQ_CFG2: usize = 0x74;
pub const SMMU_STRTAB_BASE: usize = 0x80;
pub const SMMU_STRTAB_BASE_CFG: usize = 0x88;
pub const SMMU_CMDQ_BASE: usize = 0x90;
pub const SMMU_CMDQ_PROD: usize = 0x98;
pub const SMMU_CMDQ_CONS: usize = 0x9c;
pub const SMMU_EVENTQ_BASE: usize = 0xa0;
pub const SMMU_EVENTQ_IRQ_CFG0: usize = 0xb0;
pub const SMMU_EVENTQ_IRQ_CFG1: usize = 0xb8;
pub const SMMU_EVENTQ_IRQ_CFG2: usize = 0xbc;
pub const SMMU_PRIQ_BASE: usize = 0xc0;
pub const SMMU_PRIQ_IRQ_CFG0: usize = 0xd0;
pub const SMMU_PRIQ_IRQ_CFG1: usize = 0xd8;
pub const SMMU_PRIQ_IRQ_CFG2: usize = 0xdc;
pub const SMMU_EVENTQ_PROD: usize = 0x100a8;
pub const SMMU_EVENTQ_CONS: usize = 0x100ac;
pub const SMMU_PRIQ_PROD: usize = 0x100c8;
pub const SMMU_PRIQ_CONS: usize = 0x100cc;

/// Size of the register window: two 64 KiB pages.
pub const SMMU_REGION_SIZE: usize = 0x20000;

/// Error field of `SMMU_CMDQ_CONS`.
pub const CMDQ_CONS_ERR_SHIFT: u32 = 24;
pub const CMDQ_CONS_ERR_MASK: u32 = 0x7f << CMDQ_CONS_ERR_SHIFT;

/// Read-allocate hint of the queue and stream-table base registers.
pub const BASE_RA: u64 = 1 << 62;

pub const STRTAB_BASE_ADDR_MASK: u64 = 0x000f_ffff_ffff_ffc0;
pub const STRTAB_BASE_CFG_FMT_LINEAR: u32 = 0 << 16;
pub const STRTAB_BASE_CFG_FMT_2LVL: u32 = 1 << 16;
pub const STRTAB_BASE_CFG_SPLIT_SHIFT: u32 = 6;
pub const STRTAB_BASE_CFG_LOG2SIZE_SHIFT: u32 = 0;

/// Access to the register window of one SMMU.
///
/// The production implementation is [`MmioRegisters`]; the bus glue may
/// provide its own, e.g. on top of a `bus_space`-like resource.
pub trait RegisterWindow: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn read64(&self, offset: usize) -> u64;
    fn write64(&self, offset: usize, value: u64);
}

/// A memory-mapped register window.
#[derive(Debug)]
pub struct MmioRegisters {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The window only performs volatile accesses to device memory,
// which the SMMU serializes.
unsafe impl Send for MmioRegisters {}
// SAFETY: See above.
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Creates a window over the registers mapped at `base_vaddr`.
    ///
    /// # Safety
    ///
    /// `base_vaddr` must point to `size` bytes of the SMMU's register frame,
    /// mapped as device memory for as long as the window is alive.
    pub unsafe fn new(base_vaddr: usize, size: usize) -> Option<Self> {
        let base = NonNull::new(base_vaddr as *mut u8)?;
        Some(Self { base, size })
    }

    fn ptr<T>(&self, offset: usize) -> NonNull<T> {
        assert!(
            offset % size_of::<T>() == 0 && offset + size_of::<T>() <= self.size,
            "register offset {:#x} out of range",
            offset
        );
        // SAFETY: The offset is within the window checked above.
        unsafe { self.base.add(offset).cast() }
    }
}

impl RegisterWindow for MmioRegisters {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: The pointer is within the register window and aligned.
        unsafe { VolatilePtr::new(self.ptr::<u32>(offset)).read() }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: The pointer is within the register window and aligned.
        unsafe { VolatilePtr::new(self.ptr::<u32>(offset)).write(value) }
    }

    fn read64(&self, offset: usize) -> u64 {
        // SAFETY: The pointer is within the register window and aligned.
        unsafe { VolatilePtr::new(self.ptr::<u64>(offset)).read() }
    }

    fn write64(&self, offset: usize, value: u64) {
        // SAFETY: The pointer is within the register window and aligned.
        unsafe { VolatilePtr::new(self.ptr::<u64>(offset)).write(value) }
    }
}

/// Writes `value` to `reg` and waits until the shadow register `ack`
/// reflects it.
pub(crate) fn write_ack(
    regs: &dyn RegisterWindow,
    reg: usize,
    ack: usize,
    value: u32,
    max_iterations: usize,
) -> Result<()> {
    regs.write32(reg, value);
    poll_until(max_iterations, || regs.read32(ack) == value).inspect_err(|_| {
        error!(
            "failed to write register {:#x} (value {:#x}, ack {:#x})",
            reg,
            value,
            regs.read32(ack)
        );
    })?;
    Ok(())
}
