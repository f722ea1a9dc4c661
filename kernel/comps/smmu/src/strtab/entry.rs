// SPDX-License-Identifier: MPL-2.0

use bit_field::BitField;

use crate::dma::Paddr;

/// Number of 64-bit words in a stream table entry.
pub const STE_DWORDS: usize = 8;
/// Size of a stream table entry in bytes.
pub const STE_SIZE: usize = STE_DWORDS * 8;

pub(super) const STE0_VALID: u64 = 1 << 0;
const STE0_CONFIG_BYPASS: u64 = 0b100 << 1;
const STE0_CONFIG_S1_TRANS: u64 = 0b101 << 1;
/// Linear table of context descriptors.
const STE0_S1FMT_LINEAR: u64 = 0 << 4;
const STE0_S1CONTEXTPTR_MASK: u64 = 0x000f_ffff_ffff_ffc0;

/// Write-back, read-allocate cacheability for CD fetches.
const STE1_S1CIR_WBRA: u64 = 1 << 2;
const STE1_S1COR_WBRA: u64 = 1 << 4;
/// Inner shareable CD fetches.
const STE1_S1CSH_IS: u64 = 3 << 6;
/// Full ATS: translation requests are answered.
const STE1_EATS_FULLATS: u64 = 1 << 28;
/// The stream belongs to the non-secure EL1 regime.
const STE1_STRW_NSEL1: u64 = 0 << 30;
/// Shareability is taken from the incoming transaction.
const STE1_SHCFG_INCOMING: u64 = 1 << 44;

const L1_DESC_L2PTR_MASK: u64 = 0x000f_ffff_ffff_ffc0;

/// The contents of a stream table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ste {
    dwords: [u64; STE_DWORDS],
}

impl Ste {
    /// An invalid entry.
    pub const fn invalid() -> Self {
        Self {
            dwords: [0; STE_DWORDS],
        }
    }

    pub fn from_dwords(dwords: [u64; STE_DWORDS]) -> Self {
        Self { dwords }
    }

    /// Configures the entry to pass traffic through untranslated.
    pub fn set_bypass(&mut self) {
        self.dwords = [0; STE_DWORDS];
        self.dwords[0] = STE0_CONFIG_BYPASS;
        self.dwords[1] = STE1_SHCFG_INCOMING | STE1_EATS_FULLATS;
    }

    /// Configures the entry for stage-1 translation through the single
    /// context descriptor at `cd_paddr`.
    pub fn set_stage1(&mut self, cd_paddr: Paddr) {
        self.dwords = [0; STE_DWORDS];
        // S1CDMax of zero: one CD, no substreams.
        self.dwords[0] = STE0_S1FMT_LINEAR
            | STE0_CONFIG_S1_TRANS
            | (cd_paddr as u64 & STE0_S1CONTEXTPTR_MASK);
        self.dwords[1] = STE1_EATS_FULLATS
            | STE1_S1CSH_IS
            | STE1_S1CIR_WBRA
            | STE1_S1COR_WBRA
            | STE1_STRW_NSEL1;
    }

    pub fn dwords(&self) -> &[u64; STE_DWORDS] {
        &self.dwords
    }

    pub fn is_valid(&self) -> bool {
        self.dwords[0] & STE0_VALID != 0
    }

    /// The `Config` field.
    pub fn config(&self) -> u64 {
        self.dwords[0].get_bits(1..4)
    }

    /// The `S1ContextPtr` field, as an address.
    pub fn s1_context_ptr(&self) -> Paddr {
        (self.dwords[0] & STE0_S1CONTEXTPTR_MASK) as Paddr
    }
}

/// Encodes a level-1 descriptor pointing at the level-2 block at
/// `l2_paddr`, which covers `2^(span - 1)` stream IDs.
pub fn l1_descriptor(l2_paddr: Paddr, span: u32) -> u64 {
    let mut desc = l2_paddr as u64 & L1_DESC_L2PTR_MASK;
    desc.set_bits(0..5, span as u64);
    desc
}
