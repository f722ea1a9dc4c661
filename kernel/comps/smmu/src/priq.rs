// SPDX-License-Identifier: MPL-2.0

//! The PCIe page request queue.
//!
//! Page requests are only reported: no stream is configured for PRI, so a
//! request reaching the queue means a device misbehaves.

use alloc::sync::Arc;

use bit_field::BitField;
use spin::Mutex;

use crate::{
    dma::DmaMemory,
    error::Result,
    queue::{drain, Queue, QueueIndexes},
    registers::{RegisterWindow, SMMU_PRIQ_BASE, SMMU_PRIQ_CONS, SMMU_PRIQ_PROD},
};

pub const PRIQ_DWORDS: usize = 2;

const PRIQ_1_ADDR_MASK: u64 = !0xfff;

/// A decoded page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub sid: u32,
    pub ssid: Option<u32>,
    pub privileged: bool,
    pub exec: bool,
    pub read: bool,
    pub write: bool,
    /// Last request of its page request group.
    pub last: bool,
    /// Page request group index.
    pub group: u16,
    pub addr: u64,
}

impl PageRequest {
    pub fn decode(raw: &[u64; PRIQ_DWORDS]) -> Self {
        let [dw0, dw1] = *raw;
        Self {
            sid: dw0.get_bits(0..32) as u32,
            ssid: dw0.get_bit(63).then(|| dw0.get_bits(32..52) as u32),
            privileged: dw0.get_bit(58),
            exec: dw0.get_bit(59),
            read: dw0.get_bit(60),
            write: dw0.get_bit(61),
            last: dw0.get_bit(62),
            group: dw1.get_bits(0..9) as u16,
            addr: dw1 & PRIQ_1_ADDR_MASK,
        }
    }
}

/// The page request queue of one SMMU.
pub struct PriQueue {
    ring: Queue,
    indexes: Mutex<QueueIndexes>,
    regs: Arc<dyn RegisterWindow>,
}

impl PriQueue {
    pub fn alloc(
        memory: &Arc<dyn DmaMemory>,
        regs: Arc<dyn RegisterWindow>,
        log2_entries: u32,
    ) -> Result<Self> {
        let ring = Queue::alloc(
            memory,
            log2_entries,
            PRIQ_DWORDS,
            SMMU_PRIQ_PROD,
            SMMU_PRIQ_CONS,
        )?;
        let indexes = Mutex::new(ring.empty_indexes());
        Ok(Self {
            ring,
            indexes,
            regs,
        })
    }

    pub fn program(&self) {
        let mut indexes = self.indexes.lock();
        *indexes = self.ring.empty_indexes();
        self.ring.program(self.regs.as_ref(), SMMU_PRIQ_BASE);
    }

    /// Consumes every pending request; returns how many there were and
    /// whether any were lost.
    pub fn drain<F>(&self, mut on_request: F) -> (usize, bool)
    where
        F: FnMut(&PageRequest),
    {
        let mut indexes = self.indexes.lock();
        drain::<PRIQ_DWORDS, _>(&self.ring, &mut indexes, self.regs.as_ref(), |raw| {
            on_request(&PageRequest::decode(raw))
        })
    }
}
