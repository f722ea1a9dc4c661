// SPDX-License-Identifier: MPL-2.0

//! Physically-contiguous memory shared with the SMMU.
//!
//! Queues, stream tables and context descriptors live in memory that the
//! SMMU reads and writes on its own. The platform provides that memory
//! through [`DmaMemory`]; the driver only ever holds it as a [`Segment`],
//! which returns it to the platform when dropped.

use alloc::sync::Arc;
use core::fmt::Debug;

use crate::error::{Result, SmmuError};

/// Physical address.
pub type Paddr = usize;

/// Device-visible (I/O virtual) address.
pub type Daddr = usize;

/// The translation granule used by the driver.
pub const PAGE_SIZE: usize = 4096;

/// Memory that both the CPU and the SMMU can access.
///
/// All accesses are 64-bit and naturally aligned. Implementations must make
/// `read_u64` and `write_u64` volatile: the SMMU may change the memory at any
/// time and must observe every store.
pub trait DmaMemory: Send + Sync {
    /// Allocates `size` bytes of zeroed, physically-contiguous memory
    /// aligned to `align` bytes.
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<Paddr>;

    /// Returns memory obtained from [`alloc_zeroed`](Self::alloc_zeroed).
    fn dealloc(&self, paddr: Paddr, size: usize);

    /// Reads the 64-bit word at `paddr`.
    fn read_u64(&self, paddr: Paddr) -> u64;

    /// Writes the 64-bit word at `paddr`.
    fn write_u64(&self, paddr: Paddr, value: u64);
}

/// A physically-contiguous, naturally aligned region of [`DmaMemory`].
pub struct Segment {
    paddr: Paddr,
    size: usize,
    memory: Arc<dyn DmaMemory>,
}

impl Segment {
    /// Allocates a zeroed segment of `size` bytes aligned to its own size
    /// rounded up to a power of two.
    pub fn alloc(memory: &Arc<dyn DmaMemory>, size: usize) -> Result<Self> {
        let align = size.next_power_of_two();
        let paddr = memory
            .alloc_zeroed(size, align)
            .ok_or(SmmuError::NoMemory)?;
        debug_assert_eq!(paddr % align, 0);
        Ok(Self {
            paddr,
            size,
            memory: memory.clone(),
        })
    }

    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Reads the 64-bit word at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of the segment or misaligned.
    pub fn read_u64(&self, offset: usize) -> u64 {
        self.check_offset(offset);
        self.memory.read_u64(self.paddr + offset)
    }

    /// Writes the 64-bit word at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of the segment or misaligned.
    pub fn write_u64(&self, offset: usize, value: u64) {
        self.check_offset(offset);
        self.memory.write_u64(self.paddr + offset, value);
    }

    fn check_offset(&self, offset: usize) {
        assert!(
            offset % 8 == 0 && offset + 8 <= self.size,
            "offset {:#x} outside segment of {:#x} bytes",
            offset,
            self.size
        );
    }
}

impl Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("paddr", &self.paddr)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.memory.dealloc(self.paddr, self.size);
    }
}

/// Orders all previous stores to DMA memory before any later access,
/// including the register writes that tell the SMMU to look at them.
pub fn dma_barrier() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            // SAFETY: `dsb sy` only orders memory accesses.
            #[expect(unsafe_code)]
            unsafe {
                core::arch::asm!("dsb sy", options(nostack, preserves_flags))
            };
        } else {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}
