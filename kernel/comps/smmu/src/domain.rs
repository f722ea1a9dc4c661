// SPDX-License-Identifier: MPL-2.0

//! Translation domains.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt::Debug;

use bitflags::bitflags;
use spin::Mutex;

use crate::{
    cd::ContextDescriptor,
    context::SmmuContext,
    dma::{Daddr, Paddr},
    error::PageTableError,
};

bitflags! {
    /// Access permissions of an I/O mapping.
    pub struct IoProt: u32 {
        /// The device may read from the mapping.
        const READ =    1 << 0;
        /// The device may write to the mapping.
        const WRITE =   1 << 1;
    }
}

/// The page-table manager behind a domain.
///
/// The SMMU walks the table itself, so the manager must build AArch64
/// stage-1 tables with a 4 KiB granule in memory the SMMU can read.
pub trait IoPageTable: Send + Sync {
    /// Physical address of the top-level table.
    fn root_paddr(&self) -> Paddr;

    /// Maps the page at `daddr` to the frame at `paddr`.
    fn enter(&self, daddr: Daddr, paddr: Paddr, prot: IoProt) -> Result<(), PageTableError>;

    /// Unmaps the page at `daddr`.
    fn remove(&self, daddr: Daddr) -> Result<(), PageTableError>;

    /// Unmaps every page.
    fn remove_all(&self);

    /// Frees the intermediate tables. The table is empty afterwards and must
    /// not be used again.
    fn release(&self);
}

/// A translation domain: a page table, the ASID that tags its TLB entries,
/// and the context descriptor that points the SMMU at both.
pub struct SmmuDomain {
    asid: u16,
    page_table: Box<dyn IoPageTable>,
    /// Taken when the domain is freed.
    cd: Mutex<Option<ContextDescriptor>>,
    contexts: Mutex<Vec<Arc<SmmuContext>>>,
}

impl SmmuDomain {
    pub(crate) fn new(asid: u16, page_table: Box<dyn IoPageTable>, cd: ContextDescriptor) -> Self {
        Self {
            asid,
            page_table,
            cd: Mutex::new(Some(cd)),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn page_table(&self) -> &dyn IoPageTable {
        self.page_table.as_ref()
    }

    /// Physical address of the context descriptor, or `None` once the
    /// domain has been freed.
    pub fn cd_paddr(&self) -> Option<Paddr> {
        self.cd.lock().as_ref().map(ContextDescriptor::paddr)
    }

    /// The contexts bound to the domain.
    pub fn contexts(&self) -> Vec<Arc<SmmuContext>> {
        self.contexts.lock().clone()
    }

    pub fn num_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    pub(crate) fn contexts_locked(&self) -> spin::MutexGuard<'_, Vec<Arc<SmmuContext>>> {
        self.contexts.lock()
    }

    /// Like [`contexts_locked`](Self::contexts_locked), but gives up if the
    /// list is being modified.
    pub(crate) fn try_contexts_locked(
        &self,
    ) -> Option<spin::MutexGuard<'_, Vec<Arc<SmmuContext>>>> {
        self.contexts.try_lock()
    }

    pub(crate) fn take_cd(&self) -> Option<ContextDescriptor> {
        self.cd.lock().take()
    }
}

impl Debug for SmmuDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuDomain")
            .field("asid", &self.asid)
            .field("cd_paddr", &self.cd_paddr())
            .field("num_contexts", &self.num_contexts())
            .finish()
    }
}
