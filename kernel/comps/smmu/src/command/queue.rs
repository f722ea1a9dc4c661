// SPDX-License-Identifier: MPL-2.0

use alloc::sync::Arc;
use core::hint::spin_loop;

use log::{error, warn};
use spin::Mutex;

use super::{Command, SyncCompletion, CFGI_RANGE_ALL, CMD_DWORDS};
use crate::{
    dma::{dma_barrier, DmaMemory},
    error::Result,
    poll::poll_until,
    queue::{Queue, QueueIndexes},
    registers::{
        RegisterWindow, CMDQ_CONS_ERR_MASK, CMDQ_CONS_ERR_SHIFT, SMMU_CMDQ_BASE, SMMU_CMDQ_CONS,
        SMMU_CMDQ_PROD,
    },
    smmu::UnitId,
};

/// The command queue of one SMMU.
///
/// Submission is serialized by an internal lock that covers only the write
/// of the entry and the producer doorbell; waiting for a `CMD_SYNC` happens
/// outside of it.
pub struct CommandQueue {
    ring: Queue,
    indexes: Mutex<QueueIndexes>,
    regs: Arc<dyn RegisterWindow>,
    /// Whether `CMD_SYNC` can signal completion with an MSI write.
    msi: bool,
    sync_timeout: usize,
    unit: UnitId,
}

impl CommandQueue {
    pub fn alloc(
        memory: &Arc<dyn DmaMemory>,
        regs: Arc<dyn RegisterWindow>,
        log2_entries: u32,
        msi: bool,
        sync_timeout: usize,
        unit: UnitId,
    ) -> Result<Self> {
        let ring = Queue::alloc(
            memory,
            log2_entries,
            CMD_DWORDS,
            SMMU_CMDQ_PROD,
            SMMU_CMDQ_CONS,
        )?;
        let indexes = Mutex::new(ring.empty_indexes());
        Ok(Self {
            ring,
            indexes,
            regs,
            msi,
            sync_timeout,
            unit,
        })
    }

    pub fn log2_entries(&self) -> u32 {
        self.ring.log2_entries()
    }

    /// Points the hardware at the queue and resets both indexes.
    ///
    /// The queue must not be enabled in `SMMU_CR0`.
    pub fn program(&self) {
        let mut indexes = self.indexes.lock();
        *indexes = self.ring.empty_indexes();
        self.ring.program(self.regs.as_ref(), SMMU_CMDQ_BASE);
    }

    /// Writes a command to the queue and rings the doorbell.
    ///
    /// Spins for as long as the queue is full.
    pub fn enqueue(&self, cmd: Command) {
        self.submit(|_| cmd);
    }

    /// Issues a `CMD_SYNC` and waits until the SMMU has consumed every
    /// command queued before it.
    ///
    /// With MSIs, the SMMU signals completion by writing zero over the first
    /// word of the sync command itself. Without them, the consumer index is
    /// polled until it has moved past the sync command.
    pub fn try_sync(&self) -> Result<()> {
        let msi = self.msi;
        let (slot, prod) = self.submit(|slot_paddr| Command::Sync {
            completion: if msi {
                SyncCompletion::Msi {
                    addr: slot_paddr,
                    data: 0,
                }
            } else {
                SyncCompletion::None
            },
        });

        let mut cons = self.ring.empty_indexes();
        poll_until(self.sync_timeout, || {
            if msi {
                self.ring.read_first_dword(slot) == 0
            } else {
                cons.set_cons(self.regs.read32(SMMU_CMDQ_CONS));
                cons.has_consumed(prod)
            }
        })
        .inspect_err(|_| {
            error!(
                "{}: CMD_SYNC timed out (prod {:#x}, cons {:#x})",
                self.unit,
                self.regs.read32(SMMU_CMDQ_PROD),
                self.regs.read32(SMMU_CMDQ_CONS)
            );
        })?;
        Ok(())
    }

    /// Like [`try_sync`](Self::try_sync), but a timeout is only logged.
    pub fn sync(&self) {
        let _ = self.try_sync();
    }

    /// Invalidates all non-secure, non-hypervisor TLB entries.
    pub fn tlbi_all(&self) {
        self.enqueue(Command::TlbiNsnhAll);
        self.sync();
    }

    /// Invalidates all EL2 TLB entries.
    pub fn tlbi_el2_all(&self) {
        self.enqueue(Command::TlbiEl2All);
        self.sync();
    }

    pub fn tlbi_asid(&self, asid: u16) {
        self.enqueue(Command::TlbiNhAsid { asid });
        self.sync();
    }

    /// Queues the invalidation of one page of `asid` without waiting for it.
    ///
    /// The caller must issue [`sync`](Self::sync) before relying on it.
    pub fn tlbi_va(&self, asid: u16, va: u64) {
        self.enqueue(Command::TlbiNhVa {
            asid,
            addr: va,
            leaf: true,
        });
    }

    /// Invalidates the cached STE of `sid`.
    pub fn invalidate_sid(&self, sid: u32) {
        self.enqueue(Command::CfgiSte { sid, leaf: true });
        self.sync();
    }

    pub fn sync_cd(&self, sid: u32, ssid: u32, leaf: bool) {
        self.enqueue(Command::CfgiCd { sid, ssid, leaf });
        self.sync();
    }

    /// Invalidates every cached STE.
    pub fn invalidate_all_sid(&self) {
        self.enqueue(Command::CfgiSteRange {
            sid: 0,
            range: CFGI_RANGE_ALL,
        });
        self.sync();
    }

    pub fn prefetch_sid(&self, sid: u32) {
        self.enqueue(Command::PrefetchConfig { sid });
        self.sync();
    }

    /// Reports the command the SMMU stopped at after a command queue error.
    pub fn log_error_command(&self) {
        let cons = self.regs.read32(SMMU_CMDQ_CONS);
        let err = (cons & CMDQ_CONS_ERR_MASK) >> CMDQ_CONS_ERR_SHIFT;

        let mut indexes = self.ring.empty_indexes();
        indexes.set_cons(cons);
        let mut entry = [0u64; CMD_DWORDS];
        self.ring.read_entry(indexes.cons_index(), &mut entry);

        match Command::decode(&entry) {
            Some(cmd) => warn!(
                "{}: command queue error {:#x} at {} ({:#x?})",
                self.unit,
                err,
                cmd.name(),
                entry
            ),
            None => warn!(
                "{}: command queue error {:#x} at unknown command {:#x?}",
                self.unit, err, entry
            ),
        }
    }

    /// Writes the command built from the physical address of its slot, and
    /// returns the slot and the producer index after it.
    fn submit<F>(&self, build: F) -> (usize, u32)
    where
        F: FnOnce(usize) -> Command,
    {
        let mut indexes = self.indexes.lock();

        while !indexes.has_space() {
            spin_loop();
            indexes.set_cons(self.regs.read32(SMMU_CMDQ_CONS));
        }

        let slot = indexes.prod_index();
        let cmd = build(self.ring.entry_paddr(slot));
        self.ring.write_entry(slot, &cmd.encode());
        dma_barrier();

        indexes.inc_prod();
        self.regs.write32(SMMU_CMDQ_PROD, indexes.prod());
        (slot, indexes.prod())
    }
}
