// SPDX-License-Identifier: MPL-2.0

//! Stage-1 context descriptors.

use alloc::sync::Arc;

use bit_field::BitField;

use crate::{
    dma::{dma_barrier, DmaMemory, Paddr, Segment},
    error::Result,
};

/// Number of 64-bit words in a context descriptor.
pub const CD_DWORDS: usize = 8;
const CD_SIZE: usize = CD_DWORDS * 8;

/// 4 KiB translation granule for TTB0.
const CD0_TG0_4KB: u64 = 0b00 << 6;
/// Walks through TTB1 are disabled.
const CD0_EPD1: u64 = 1 << 30;
const CD0_V: u64 = 1 << 31;
/// Intermediate physical size of 48 bits.
const CD0_IPS_48BITS: u64 = 0b101 << 32;
/// AArch64 translation tables.
const CD0_AA64: u64 = 1 << 41;
/// Translation faults are recorded in the event queue.
const CD0_R: u64 = 1 << 45;
/// Translation faults abort the transaction.
const CD0_A: u64 = 1 << 46;
/// ASID-set: the ASID is not shared with the CPU.
const CD0_ASET: u64 = 1 << 47;
const CD1_TTB0_MASK: u64 = 0x000f_ffff_ffff_fff0;

/// Largest input address size a four-level table with 4 KiB pages maps.
pub const CD_MAX_IAS: u32 = 48;

// MAIR attribute indexes 0 to 3.
const MAIR_DEVICE_NGNRNE: u64 = 0x00;
const MAIR_NORMAL_NC: u64 = 0x44;
const MAIR_NORMAL_WB: u64 = 0xff;
const MAIR_NORMAL_WT: u64 = 0xbb;

/// The context descriptor of a domain.
///
/// It is written once, when the domain is created, and freed with it.
#[derive(Debug)]
pub struct ContextDescriptor {
    segment: Segment,
    asid: u16,
}

impl ContextDescriptor {
    /// Allocates and fills a context descriptor that translates through the
    /// table at `ttb0`, tagging TLB entries with `asid`.
    ///
    /// `ias` is the input address size of the unit in bits.
    pub fn init(memory: &Arc<dyn DmaMemory>, asid: u16, ttb0: Paddr, ias: u32) -> Result<Self> {
        let segment = Segment::alloc(memory, CD_SIZE)?;

        let t0sz = 64 - ias.min(CD_MAX_IAS) as u64;
        let mut dw0 = CD0_TG0_4KB
            | CD0_EPD1
            | CD0_IPS_48BITS
            | CD0_AA64
            | CD0_R
            | CD0_A
            | CD0_ASET
            | CD0_V;
        dw0.set_bits(0..6, t0sz);
        dw0.set_bits(48..64, asid as u64);

        let dw1 = ttb0 as u64 & CD1_TTB0_MASK;
        let dw3 = MAIR_DEVICE_NGNRNE
            | (MAIR_NORMAL_NC << 8)
            | (MAIR_NORMAL_WB << 16)
            | (MAIR_NORMAL_WT << 24);

        segment.write_u64(8, dw1);
        segment.write_u64(3 * 8, dw3);
        dma_barrier();
        segment.write_u64(0, dw0);
        dma_barrier();

        Ok(Self { segment, asid })
    }

    pub fn paddr(&self) -> Paddr {
        self.segment.paddr()
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// Reads word `index` of the descriptor.
    pub fn dword(&self, index: usize) -> u64 {
        assert!(index < CD_DWORDS);
        self.segment.read_u64(index * 8)
    }
}
