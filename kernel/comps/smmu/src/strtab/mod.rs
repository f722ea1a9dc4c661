// SPDX-License-Identifier: MPL-2.0

//! The stream table, which maps a stream ID to its [`Ste`].
//!
//! A linear table is a flat array of STEs indexed by stream ID. A two-level
//! table splits the stream ID at [`STRTAB_SPLIT`]: the upper bits select a
//! level-1 descriptor, which points at a level-2 block of `2^STRTAB_SPLIT`
//! STEs. Level-2 blocks are allocated the first time a stream ID inside
//! them is used.
//!
//! Every STE update follows the same protocol, implemented once by
//! [`StreamTable::with_entry_invalidated`]: the SMMU must never observe a
//! valid entry whose other words are not final.

mod entry;

use alloc::{sync::Arc, vec, vec::Vec};

pub use entry::{l1_descriptor, Ste, STE_DWORDS, STE_SIZE};
use entry::STE0_VALID;
use log::debug;
use spin::Mutex;

use crate::{
    command::CommandQueue,
    dma::{dma_barrier, DmaMemory, Paddr, Segment},
    error::{Result, SmmuError},
    registers::{
        RegisterWindow, BASE_RA, SMMU_STRTAB_BASE, SMMU_STRTAB_BASE_CFG,
        STRTAB_BASE_ADDR_MASK, STRTAB_BASE_CFG_FMT_2LVL, STRTAB_BASE_CFG_FMT_LINEAR,
        STRTAB_BASE_CFG_LOG2SIZE_SHIFT, STRTAB_BASE_CFG_SPLIT_SHIFT,
    },
};

/// The number of low stream ID bits resolved by a level-2 block.
pub const STRTAB_SPLIT: u32 = 8;

const L1_DESC_SIZE: usize = 8;
const L2_STES: usize = 1 << STRTAB_SPLIT;
const L2_BLOCK_SIZE: usize = L2_STES * STE_SIZE;
/// `Span` of a level-1 descriptor covering a whole level-2 block.
const L1_DESC_SPAN: u32 = STRTAB_SPLIT + 1;

enum Layout {
    Linear {
        table: Segment,
    },
    TwoLevel {
        l1: Segment,
        /// For each level-1 descriptor, the index of its block in `blocks`.
        l2_slots: Vec<Option<usize>>,
        blocks: Vec<Segment>,
    },
}

/// Where an STE lives: a segment of the table and the byte offset in it.
struct Slot<'a> {
    segment: &'a Segment,
    offset: usize,
}

impl Slot<'_> {
    fn read(&self) -> Ste {
        let mut dwords = [0u64; STE_DWORDS];
        for (i, dword) in dwords.iter_mut().enumerate() {
            *dword = self.segment.read_u64(self.offset + i * 8);
        }
        Ste::from_dwords(dwords)
    }

    fn write_dword(&self, index: usize, value: u64) {
        self.segment.write_u64(self.offset + index * 8, value);
    }

    fn paddr(&self) -> Paddr {
        self.segment.paddr() + self.offset
    }
}

/// The stream table of one SMMU.
pub struct StreamTable {
    memory: Arc<dyn DmaMemory>,
    /// `LOG2SIZE` of `SMMU_STRTAB_BASE_CFG`.
    log2_size: u32,
    num_l1_entries: usize,
    layout: Mutex<Layout>,
}

impl StreamTable {
    /// Allocates a linear table covering `sid_bits` of stream ID.
    pub fn new_linear(memory: &Arc<dyn DmaMemory>, sid_bits: u32) -> Result<Self> {
        let size = (1usize << sid_bits) * STE_SIZE;
        let table = Segment::alloc(memory, size)?;
        debug!(
            "linear stream table: {} entries at {:#x}",
            1usize << sid_bits,
            table.paddr()
        );
        Ok(Self {
            memory: memory.clone(),
            log2_size: sid_bits,
            num_l1_entries: 0,
            layout: Mutex::new(Layout::Linear { table }),
        })
    }

    /// Allocates the level-1 table of a two-level table covering `sid_bits`
    /// of stream ID, with a level-1 table no larger than `2^l1_size_shift`
    /// bytes.
    pub fn new_two_level(
        memory: &Arc<dyn DmaMemory>,
        sid_bits: u32,
        l1_size_shift: u32,
    ) -> Result<Self> {
        debug_assert!(sid_bits > STRTAB_SPLIT);
        // A level-1 table always holds at least one descriptor.
        let l1_bits = l1_size_shift
            .saturating_sub(L1_DESC_SIZE.trailing_zeros())
            .min(sid_bits - STRTAB_SPLIT);
        let num_l1_entries = 1usize << l1_bits;
        let l1 = Segment::alloc(memory, num_l1_entries * L1_DESC_SIZE)?;
        debug!(
            "two-level stream table: {} level-1 descriptors at {:#x}",
            num_l1_entries,
            l1.paddr()
        );
        Ok(Self {
            memory: memory.clone(),
            log2_size: l1_bits + STRTAB_SPLIT,
            num_l1_entries,
            layout: Mutex::new(Layout::TwoLevel {
                l1,
                l2_slots: vec![None; num_l1_entries],
                blocks: Vec::new(),
            }),
        })
    }

    pub fn is_two_level(&self) -> bool {
        matches!(*self.layout.lock(), Layout::TwoLevel { .. })
    }

    /// The number of level-1 descriptors, or zero for a linear table.
    pub fn num_l1_entries(&self) -> usize {
        self.num_l1_entries
    }

    /// The number of level-2 blocks allocated so far.
    pub fn num_l2_blocks(&self) -> usize {
        match &*self.layout.lock() {
            Layout::Linear { .. } => 0,
            Layout::TwoLevel { blocks, .. } => blocks.len(),
        }
    }

    /// The number of stream IDs the table can hold.
    pub fn num_stream_ids(&self) -> usize {
        1 << self.log2_size
    }

    /// The value of `SMMU_STRTAB_BASE`.
    pub fn base_reg_value(&self) -> u64 {
        let paddr = match &*self.layout.lock() {
            Layout::Linear { table } => table.paddr(),
            Layout::TwoLevel { l1, .. } => l1.paddr(),
        };
        BASE_RA | (paddr as u64 & STRTAB_BASE_ADDR_MASK)
    }

    /// The value of `SMMU_STRTAB_BASE_CFG`.
    pub fn base_cfg_reg_value(&self) -> u32 {
        let fmt = if self.is_two_level() {
            STRTAB_BASE_CFG_FMT_2LVL | (STRTAB_SPLIT << STRTAB_BASE_CFG_SPLIT_SHIFT)
        } else {
            STRTAB_BASE_CFG_FMT_LINEAR
        };
        fmt | (self.log2_size << STRTAB_BASE_CFG_LOG2SIZE_SHIFT)
    }

    /// Points the hardware at the table.
    pub fn program(&self, regs: &dyn RegisterWindow) {
        regs.write64(SMMU_STRTAB_BASE, self.base_reg_value());
        regs.write32(SMMU_STRTAB_BASE_CFG, self.base_cfg_reg_value());
    }

    /// Returns the physical address of the STE of `sid`, allocating the
    /// level-2 block that holds it if needed.
    pub fn get_ste_addr(&self, sid: u32) -> Result<Paddr> {
        self.check_sid(sid)?;
        let mut layout = self.layout.lock();
        let slot = self.locate(&mut layout, sid)?;
        Ok(slot.paddr())
    }

    /// Reads the STE of `sid` without allocating anything.
    ///
    /// Stream IDs whose level-2 block does not exist yet read as invalid.
    pub fn lookup(&self, sid: u32) -> Result<Ste> {
        self.check_sid(sid)?;
        let layout = self.layout.lock();
        Ok(Self::existing_slot(&layout, sid)
            .map(|slot| slot.read())
            .unwrap_or(Ste::invalid()))
    }

    /// Like [`lookup`](Self::lookup), but returns `None` if the table is
    /// being updated.
    pub fn try_lookup(&self, sid: u32) -> Option<Ste> {
        self.check_sid(sid).ok()?;
        let layout = self.layout.try_lock()?;
        Some(
            Self::existing_slot(&layout, sid)
                .map(|slot| slot.read())
                .unwrap_or(Ste::invalid()),
        )
    }

    /// Rewrites the STE of `sid` with the fields set by `build`.
    ///
    /// The sequence seen by the SMMU is:
    ///
    /// 1. If the entry is valid, word 0 is cleared and the STE invalidated,
    ///    otherwise the STE is invalidated as is;
    /// 2. words 1 to 7 are written, then the STE is invalidated again;
    /// 3. word 0 is written with the valid bit set, after a barrier, and the
    ///    STE is invalidated a last time.
    pub fn with_entry_invalidated<F>(&self, cmdq: &CommandQueue, sid: u32, build: F) -> Result<()>
    where
        F: FnOnce(&mut Ste),
    {
        self.check_sid(sid)?;
        let mut layout = self.layout.lock();
        let slot = self.locate(&mut layout, sid)?;

        if slot.read().is_valid() {
            slot.write_dword(0, 0);
            dma_barrier();
        }
        cmdq.invalidate_sid(sid);

        let mut ste = Ste::invalid();
        build(&mut ste);
        let dwords = ste.dwords();
        for (i, dword) in dwords.iter().enumerate().skip(1) {
            slot.write_dword(i, *dword);
        }
        cmdq.invalidate_sid(sid);

        dma_barrier();
        slot.write_dword(0, dwords[0] | STE0_VALID);
        dma_barrier();
        cmdq.invalidate_sid(sid);
        Ok(())
    }

    /// Makes `sid` bypass translation.
    pub fn init_ste_bypass(&self, cmdq: &CommandQueue, sid: u32) -> Result<()> {
        self.with_entry_invalidated(cmdq, sid, |ste| ste.set_bypass())?;
        cmdq.prefetch_sid(sid);
        Ok(())
    }

    /// Makes `sid` translate through the context descriptor at `cd_paddr`.
    pub fn init_ste_s1(&self, cmdq: &CommandQueue, cd_paddr: Paddr, sid: u32) -> Result<()> {
        self.with_entry_invalidated(cmdq, sid, |ste| ste.set_stage1(cd_paddr))?;
        cmdq.sync_cd(sid, 0, true);
        cmdq.invalidate_sid(sid);
        cmdq.prefetch_sid(sid);
        Ok(())
    }

    /// Invalidates the STE of `sid`.
    pub fn deinit_ste(&self, cmdq: &CommandQueue, sid: u32) -> Result<()> {
        self.check_sid(sid)?;
        let layout = self.layout.lock();
        let Some(slot) = Self::existing_slot(&layout, sid) else {
            return Ok(());
        };

        slot.write_dword(0, 0);
        dma_barrier();
        cmdq.invalidate_sid(sid);
        cmdq.sync_cd(sid, 0, true);
        cmdq.invalidate_sid(sid);
        cmdq.sync();
        Ok(())
    }

    fn check_sid(&self, sid: u32) -> Result<()> {
        if (sid as usize) < self.num_stream_ids() {
            Ok(())
        } else {
            Err(SmmuError::InvalidStreamId(sid))
        }
    }

    fn existing_slot(layout: &Layout, sid: u32) -> Option<Slot<'_>> {
        let sid = sid as usize;
        match layout {
            Layout::Linear { table } => Some(Slot {
                segment: table,
                offset: sid * STE_SIZE,
            }),
            Layout::TwoLevel {
                l2_slots, blocks, ..
            } => {
                let block = (*l2_slots.get(sid >> STRTAB_SPLIT)?)?;
                Some(Slot {
                    segment: &blocks[block],
                    offset: (sid & (L2_STES - 1)) * STE_SIZE,
                })
            }
        }
    }

    fn locate<'a>(&self, layout: &'a mut Layout, sid: u32) -> Result<Slot<'a>> {
        if let Layout::TwoLevel {
            l1,
            l2_slots,
            blocks,
        } = layout
        {
            let l1_index = sid as usize >> STRTAB_SPLIT;
            if l2_slots[l1_index].is_none() {
                let block = Segment::alloc(&self.memory, L2_BLOCK_SIZE)?;
                l1.write_u64(
                    l1_index * L1_DESC_SIZE,
                    l1_descriptor(block.paddr(), L1_DESC_SPAN),
                );
                dma_barrier();
                debug!(
                    "stream table: level-2 block for stream IDs {:#x}.. at {:#x}",
                    l1_index << STRTAB_SPLIT,
                    block.paddr()
                );
                blocks.push(block);
                l2_slots[l1_index] = Some(blocks.len() - 1);
            }
        }
        Self::existing_slot(layout, sid).ok_or(SmmuError::InvalidStreamId(sid))
    }
}
