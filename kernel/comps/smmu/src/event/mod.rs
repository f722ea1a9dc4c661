// SPDX-License-Identifier: MPL-2.0

//! Fault records written by the SMMU to the event queue.

mod quirk;

use alloc::sync::Arc;

use bit_field::BitField;
pub use quirk::{is_suppressed, EventQuirk, EVENT_QUIRKS};
use spin::Mutex;

use crate::{
    dma::DmaMemory,
    error::Result,
    queue::{drain, Queue, QueueIndexes},
    registers::{RegisterWindow, SMMU_EVENTQ_BASE, SMMU_EVENTQ_CONS, SMMU_EVENTQ_PROD},
};

/// Number of 64-bit words in an event queue entry.
pub const EVT_DWORDS: usize = 4;

const EVT_IPA_MASK: u64 = 0x000f_ffff_ffff_fff8;

/// A kind of event, as numbered by the architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventType {
    pub id: u8,
    pub name: &'static str,
    pub description: &'static str,
}

const fn event(id: u8, name: &'static str, description: &'static str) -> EventType {
    EventType {
        id,
        name,
        description,
    }
}

pub static EVENT_TYPES: &[EventType] = &[
    event(0x01, "F_UUT", "unsupported upstream transaction"),
    event(0x02, "C_BAD_STREAMID", "stream ID out of range"),
    event(0x03, "F_STE_FETCH", "external abort while fetching the STE"),
    event(0x04, "C_BAD_STE", "the STE is invalid"),
    event(
        0x05,
        "F_BAD_ATS_TREQ",
        "ATS translation request received while ATS is disabled for the stream",
    ),
    event(
        0x06,
        "F_STREAM_DISABLED",
        "non-substream transactions are disabled for the stream",
    ),
    event(
        0x07,
        "F_TRANSL_FORBIDDEN",
        "translated PCIe transaction while bypass is disallowed for the stream",
    ),
    event(0x08, "C_BAD_SUBSTREAMID", "substream ID present but not configured"),
    event(0x09, "F_CD_FETCH", "external abort while fetching the CD"),
    event(0x0a, "C_BAD_CD", "the CD is invalid"),
    event(
        0x0b,
        "F_WALK_EABT",
        "external abort while fetching or updating a translation table descriptor",
    ),
    event(0x10, "F_TRANSLATION", "translation fault"),
    event(0x11, "F_ADDR_SIZE", "address size fault"),
    event(0x12, "F_ACCESS", "access flag fault"),
    event(0x13, "F_PERMISSION", "permission fault"),
    event(0x20, "F_TLB_CONFLICT", "TLB conflict"),
    event(0x21, "F_CFG_CONFLICT", "configuration cache conflict"),
    event(0x24, "E_PAGE_REQUEST", "speculative page request hint"),
    event(0x25, "F_VMS_FETCH", "external abort while fetching the VMS"),
];

/// Looks up the event type numbered `id`.
pub fn event_type(id: u8) -> Option<&'static EventType> {
    EVENT_TYPES.iter().find(|ty| ty.id == id)
}

/// A decoded event queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub id: u8,
    pub sid: u32,
    /// The substream ID, if the transaction carried one.
    pub ssid: Option<u32>,
    /// Whether the faulting access was a read.
    pub read: bool,
    pub input_addr: u64,
    pub ipa: u64,
    pub raw: [u64; EVT_DWORDS],
}

impl EventRecord {
    pub fn decode(raw: &[u64; EVT_DWORDS]) -> Self {
        let [dw0, dw1, dw2, dw3] = *raw;
        Self {
            id: dw0.get_bits(0..8) as u8,
            sid: dw0.get_bits(32..64) as u32,
            ssid: dw0.get_bit(11).then(|| dw0.get_bits(12..32) as u32),
            read: dw1.get_bit(35),
            input_addr: dw2,
            ipa: dw3 & EVT_IPA_MASK,
            raw: *raw,
        }
    }

    pub fn event_type(&self) -> Option<&'static EventType> {
        event_type(self.id)
    }
}

/// The outcome of draining the event queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventQueueReport {
    /// Events that were logged.
    pub reported: usize,
    /// Events that matched a quirk.
    pub suppressed: usize,
    /// The SMMU dropped events because the queue was full.
    pub overflowed: bool,
}

/// The event queue of one SMMU.
pub struct EventQueue {
    ring: Queue,
    indexes: Mutex<QueueIndexes>,
    regs: Arc<dyn RegisterWindow>,
}

impl EventQueue {
    pub fn alloc(
        memory: &Arc<dyn DmaMemory>,
        regs: Arc<dyn RegisterWindow>,
        log2_entries: u32,
    ) -> Result<Self> {
        let ring = Queue::alloc(
            memory,
            log2_entries,
            EVT_DWORDS,
            SMMU_EVENTQ_PROD,
            SMMU_EVENTQ_CONS,
        )?;
        let indexes = Mutex::new(ring.empty_indexes());
        Ok(Self {
            ring,
            indexes,
            regs,
        })
    }

    pub fn log2_entries(&self) -> u32 {
        self.ring.log2_entries()
    }

    /// Points the hardware at the queue and resets both indexes.
    pub fn program(&self) {
        let mut indexes = self.indexes.lock();
        *indexes = self.ring.empty_indexes();
        self.ring.program(self.regs.as_ref(), SMMU_EVENTQ_BASE);
    }

    /// Consumes every pending event. `on_event` returns whether the event
    /// was suppressed.
    ///
    /// The queue lock is held while `on_event` runs.
    pub fn drain<F>(&self, mut on_event: F) -> EventQueueReport
    where
        F: FnMut(&EventRecord) -> bool,
    {
        let mut report = EventQueueReport::default();
        let mut indexes = self.indexes.lock();
        let (_, overflowed) = drain::<EVT_DWORDS, _>(
            &self.ring,
            &mut indexes,
            self.regs.as_ref(),
            |raw| {
                if on_event(&EventRecord::decode(raw)) {
                    report.suppressed += 1;
                } else {
                    report.reported += 1;
                }
            },
        );
        report.overflowed = overflowed;
        report
    }
}
