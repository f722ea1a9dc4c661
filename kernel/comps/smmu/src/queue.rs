// SPDX-License-Identifier: MPL-2.0

//! Circular queues shared with the SMMU.
//!
//! A queue holds `2^log2` fixed-size entries. Its producer and consumer
//! indexes are packed the way the hardware packs them in the `*_PROD` and
//! `*_CONS` registers:
//!
//! ```text
//!  31      log2   log2-1        0
//! +---+---...---+------+--------+
//! |OVF|  (zero) | WRAP | INDEX  |
//! +---+---...---+------+--------+
//! ```
//!
//! The wrap bit flips every time an index passes the end of the ring, so a
//! full ring (same index, different wrap) can be told apart from an empty
//! one (same index, same wrap) without sacrificing a slot.

use alloc::sync::Arc;

use crate::{
    dma::{DmaMemory, Paddr, Segment},
    error::Result,
    registers::{RegisterWindow, BASE_RA},
};

/// Overflow flag of the packed queue indexes.
pub const QUEUE_OVF: u32 = 1 << 31;

const QUEUE_BASE_ADDR_MASK: u64 = 0x000f_ffff_ffff_ffe0;
const QUEUE_MIN_BYTES: usize = 32;

/// The locally cached producer and consumer indexes of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueIndexes {
    log2_entries: u32,
    prod: u32,
    cons: u32,
}

impl QueueIndexes {
    /// Creates the indexes of an empty queue with `2^log2_entries` slots.
    pub const fn new(log2_entries: u32) -> Self {
        assert!(log2_entries < 31);
        Self {
            log2_entries,
            prod: 0,
            cons: 0,
        }
    }

    pub fn log2_entries(&self) -> u32 {
        self.log2_entries
    }

    /// The packed producer index.
    pub fn prod(&self) -> u32 {
        self.prod
    }

    /// The packed consumer index.
    pub fn cons(&self) -> u32 {
        self.cons
    }

    /// Updates the producer index from the hardware register.
    pub fn set_prod(&mut self, raw: u32) {
        self.prod = raw & self.valid_bits();
    }

    /// Updates the consumer index from the hardware register. Fields other
    /// than the index, the wrap bit and the overflow flag are dropped.
    pub fn set_cons(&mut self, raw: u32) {
        self.cons = raw & self.valid_bits();
    }

    /// The slot the producer will write next.
    pub fn prod_index(&self) -> usize {
        self.index(self.prod) as usize
    }

    /// The slot the consumer will read next.
    pub fn cons_index(&self) -> usize {
        self.index(self.cons) as usize
    }

    /// Whether the producer may write one more entry.
    pub fn has_space(&self) -> bool {
        self.index(self.cons) != self.index(self.prod) || self.wrap(self.cons) == self.wrap(self.prod)
    }

    /// Whether the consumer has caught up with the producer.
    pub fn is_empty(&self) -> bool {
        self.index(self.cons) == self.index(self.prod) && self.wrap(self.cons) == self.wrap(self.prod)
    }

    /// Advances the producer by one slot, keeping its overflow flag.
    pub fn inc_prod(&mut self) {
        self.prod = self.incremented(self.prod);
    }

    /// Advances the consumer by one slot, keeping its overflow flag.
    pub fn inc_cons(&mut self) {
        self.cons = self.incremented(self.cons);
    }

    /// Whether the consumer has caught up with the packed producer value
    /// `prod`, that is, has consumed every entry written before it.
    ///
    /// The consumer may also be ahead of `prod`, by less than a full ring.
    pub fn has_consumed(&self, prod: u32) -> bool {
        let pending = prod.wrapping_sub(self.cons) & self.wrap_and_index_mask();
        pending == 0 || pending > (1 << self.log2_entries)
    }

    /// Whether the producer reported entries lost since the consumer last
    /// acknowledged an overflow.
    pub fn has_overflowed(&self) -> bool {
        (self.prod & QUEUE_OVF) != (self.cons & QUEUE_OVF)
    }

    /// Acknowledges an overflow by copying the producer's flag into the
    /// consumer index.
    pub fn ack_overflow(&mut self) {
        self.cons = (self.cons & !QUEUE_OVF) | (self.prod & QUEUE_OVF);
    }

    fn incremented(&self, packed: u32) -> u32 {
        let wrap_and_index = self.wrap_and_index_mask();
        let next = ((packed & wrap_and_index) + 1) & wrap_and_index;
        (packed & QUEUE_OVF) | next
    }

    fn index(&self, packed: u32) -> u32 {
        packed & ((1 << self.log2_entries) - 1)
    }

    fn wrap(&self, packed: u32) -> u32 {
        packed & (1 << self.log2_entries)
    }

    fn wrap_and_index_mask(&self) -> u32 {
        (1 << (self.log2_entries + 1)) - 1
    }

    fn valid_bits(&self) -> u32 {
        self.wrap_and_index_mask() | QUEUE_OVF
    }
}

/// The ring of a queue in DMA memory, together with the offsets of its
/// index registers.
///
/// The cached [`QueueIndexes`] are kept by the owner of the ring, under the
/// owner's lock, so that entries can still be inspected without it.
#[derive(Debug)]
pub struct Queue {
    segment: Segment,
    entry_dwords: usize,
    log2_entries: u32,
    prod_reg: usize,
    cons_reg: usize,
}

impl Queue {
    /// Allocates a zeroed queue of `2^log2_entries` entries, each
    /// `entry_dwords` 64-bit words long.
    pub fn alloc(
        memory: &Arc<dyn DmaMemory>,
        log2_entries: u32,
        entry_dwords: usize,
        prod_reg: usize,
        cons_reg: usize,
    ) -> Result<Self> {
        let bytes = ((1usize << log2_entries) * entry_dwords * 8).max(QUEUE_MIN_BYTES);
        let segment = Segment::alloc(memory, bytes)?;
        Ok(Self {
            segment,
            entry_dwords,
            log2_entries,
            prod_reg,
            cons_reg,
        })
    }

    pub fn log2_entries(&self) -> u32 {
        self.log2_entries
    }

    /// Indexes of the queue in its empty state.
    pub fn empty_indexes(&self) -> QueueIndexes {
        QueueIndexes::new(self.log2_entries)
    }

    pub fn prod_reg(&self) -> usize {
        self.prod_reg
    }

    pub fn cons_reg(&self) -> usize {
        self.cons_reg
    }

    pub fn entry_dwords(&self) -> usize {
        self.entry_dwords
    }

    /// The value of the queue's `*_BASE` register.
    pub fn base_reg_value(&self) -> u64 {
        BASE_RA
            | (self.segment.paddr() as u64 & QUEUE_BASE_ADDR_MASK)
            | self.log2_entries as u64
    }

    /// Physical address of the entry at slot `index`.
    pub fn entry_paddr(&self, index: usize) -> Paddr {
        self.segment.paddr() + self.entry_offset(index)
    }

    /// Writes the entry at slot `index`.
    pub fn write_entry(&self, index: usize, entry: &[u64]) {
        debug_assert_eq!(entry.len(), self.entry_dwords);
        let offset = self.entry_offset(index);
        for (i, dword) in entry.iter().enumerate() {
            self.segment.write_u64(offset + i * 8, *dword);
        }
    }

    /// Reads the entry at slot `index` into `entry`.
    pub fn read_entry(&self, index: usize, entry: &mut [u64]) {
        debug_assert_eq!(entry.len(), self.entry_dwords);
        let offset = self.entry_offset(index);
        for (i, dword) in entry.iter_mut().enumerate() {
            *dword = self.segment.read_u64(offset + i * 8);
        }
    }

    /// Reads the first word of the entry at slot `index`.
    pub fn read_first_dword(&self, index: usize) -> u64 {
        self.segment.read_u64(self.entry_offset(index))
    }

    /// Programs the base register and resets both index registers to zero.
    pub fn program(&self, regs: &dyn RegisterWindow, base_reg: usize) {
        regs.write64(base_reg, self.base_reg_value());
        regs.write32(self.prod_reg, 0);
        regs.write32(self.cons_reg, 0);
    }

    fn entry_offset(&self, index: usize) -> usize {
        debug_assert!(index < (1 << self.log2_entries));
        index * self.entry_dwords * 8
    }
}

/// Consumes every entry the SMMU has produced in `ring`, passing each one
/// to `on_entry`, and returns how many were consumed and whether the SMMU
/// reported an overflow in the meantime.
///
/// The consumer register is updated after each entry so that the SMMU can
/// reuse the slot right away. An overflow is acknowledged, not repaired: the
/// lost entries are gone.
pub fn drain<const N: usize, F>(
    ring: &Queue,
    indexes: &mut QueueIndexes,
    regs: &dyn RegisterWindow,
    mut on_entry: F,
) -> (usize, bool)
where
    F: FnMut(&[u64; N]),
{
    debug_assert_eq!(ring.entry_dwords(), N);
    let mut consumed = 0;
    let mut overflowed = false;

    loop {
        indexes.set_prod(regs.read32(ring.prod_reg()));
        if indexes.has_overflowed() {
            overflowed = true;
            indexes.ack_overflow();
        }
        if indexes.is_empty() {
            break;
        }

        while !indexes.is_empty() {
            let mut entry = [0u64; N];
            ring.read_entry(indexes.cons_index(), &mut entry);
            indexes.inc_cons();
            regs.write32(ring.cons_reg(), indexes.cons());
            on_entry(&entry);
            consumed += 1;
        }
    }

    regs.write32(ring.cons_reg(), indexes.cons());
    (consumed, overflowed)
}
