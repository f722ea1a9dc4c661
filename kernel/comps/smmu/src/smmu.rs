// SPDX-License-Identifier: MPL-2.0

//! One SMMU unit.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;

use id_alloc::IdAlloc;
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::{
    cd::{ContextDescriptor, CD_MAX_IAS},
    command::CommandQueue,
    context::{ContextState, IommuDevice, PciDeviceLocation, SmmuContext, StreamIdMap, StreamIds},
    dma::{Daddr, DmaMemory, Paddr, PAGE_SIZE},
    domain::{IoPageTable, IoProt, SmmuDomain},
    error::{PageTableError, Result, SmmuError},
    event::{is_suppressed, EventQueue, EventQueueReport, EventRecord},
    options::SmmuOptions,
    priq::PriQueue,
    registers::{
        write_ack, Control0, Control1, Control2, GlobalError, IrqControl, RegisterWindow,
        SmmuFeatures, SMMU_CR0, SMMU_CR0ACK, SMMU_CR1, SMMU_CR2, SMMU_EVENTQ_IRQ_CFG0,
        SMMU_GERROR, SMMU_GERRORN, SMMU_GERROR_IRQ_CFG0, SMMU_IRQ_CTRL, SMMU_IRQ_CTRLACK,
        SMMU_PRIQ_IRQ_CFG0,
    },
    strtab::StreamTable,
};

/// The firmware cross-reference of a unit, used to name it in logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "smmu@{:#x}", self.0)
    }
}

/// What the bus glue hands over when attaching a unit.
pub struct SmmuResources {
    /// The register window, already mapped.
    pub regs: Arc<dyn RegisterWindow>,
    /// Memory for queues and tables.
    pub memory: Arc<dyn DmaMemory>,
    /// The firmware's stream ID mapping for PCI devices behind the unit.
    pub stream_ids: Arc<dyn StreamIdMap>,
    /// The firmware cross-reference of the unit (IORT node offset or
    /// device tree phandle).
    pub xref: u64,
}

/// An attached SMMUv3.
pub struct Smmu {
    unit: UnitId,
    regs: Arc<dyn RegisterWindow>,
    memory: Arc<dyn DmaMemory>,
    stream_ids: Arc<dyn StreamIdMap>,
    features: SmmuFeatures,
    options: SmmuOptions,
    cmdq: CommandQueue,
    evtq: EventQueue,
    priq: Option<PriQueue>,
    strtab: StreamTable,
    asids: Mutex<IdAlloc>,
    domains: Mutex<Vec<Arc<SmmuDomain>>>,
}

impl Smmu {
    /// Probes the unit, allocates its queues and stream table, and enables
    /// it.
    ///
    /// Nothing is left allocated if this fails.
    pub fn attach(resources: SmmuResources, options: SmmuOptions) -> Result<Arc<Self>> {
        let SmmuResources {
            regs,
            memory,
            stream_ids,
            xref,
        } = resources;
        let unit = UnitId(xref);

        let features = SmmuFeatures::probe(regs.as_ref())
            .inspect_err(|err| error!("{}: unsupported unit: {}", unit, err))?;
        debug!("{}: {:?}", unit, features);

        let cmdq_log2 = features.cmdq_log2.min(options.max_cmdq_log2);
        let evtq_log2 = features.evtq_log2.min(options.max_evtq_log2);
        let priq_log2 = features.priq_log2.min(options.max_priq_log2);

        if !features.msi {
            info!("{}: no MSI support, CMD_SYNC completion is polled", unit);
        }
        let cmdq = CommandQueue::alloc(
            &memory,
            regs.clone(),
            cmdq_log2,
            features.msi,
            options.sync_timeout,
            unit,
        )?;
        let evtq = EventQueue::alloc(&memory, regs.clone(), evtq_log2)?;
        let priq = if features.pri {
            Some(PriQueue::alloc(&memory, regs.clone(), priq_log2)?)
        } else {
            None
        };

        let strtab = if features.two_level_strtab && !options.force_linear_stream_table {
            StreamTable::new_two_level(&memory, features.sid_bits, options.l1_size_shift)?
        } else {
            StreamTable::new_linear(&memory, features.sid_bits)?
        };

        let asids = Mutex::new(IdAlloc::with_capacity(1 << features.asid_bits));

        let smmu = Self {
            unit,
            regs,
            memory,
            stream_ids,
            features,
            options,
            cmdq,
            evtq,
            priq,
            strtab,
            asids,
            domains: Mutex::new(Vec::new()),
        };
        if let Err(err) = smmu.reset() {
            // The queues may already be enabled; stop the unit before their
            // memory is released.
            let _ = smmu.disable();
            return Err(err);
        }

        info!(
            "{}: attached, {} stream table, {}-bit stream IDs, {}-bit ASIDs, queues 2^{}/2^{}",
            unit,
            if smmu.strtab.is_two_level() {
                "two-level"
            } else {
                "linear"
            },
            features.sid_bits,
            features.asid_bits,
            cmdq_log2,
            evtq_log2,
        );
        Ok(Arc::new(smmu))
    }

    /// Brings the unit from any state to enabled, with empty queues and
    /// every cached configuration and translation invalidated.
    pub fn reset(&self) -> Result<()> {
        let regs = self.regs.as_ref();
        let ack_timeout = self.options.ack_timeout;

        if Control0::from_bits_truncate(regs.read32(SMMU_CR0)).contains(Control0::SMMUEN) {
            warn!("{}: already enabled, disabling", self.unit);
        }

        write_ack(regs, SMMU_CR0, SMMU_CR0ACK, 0, ack_timeout)?;
        write_ack(regs, SMMU_IRQ_CTRL, SMMU_IRQ_CTRLACK, 0, ack_timeout)?;

        // Wired interrupts only.
        regs.write64(SMMU_GERROR_IRQ_CFG0, 0);
        regs.write64(SMMU_EVENTQ_IRQ_CFG0, 0);
        if self.priq.is_some() {
            regs.write64(SMMU_PRIQ_IRQ_CFG0, 0);
        }

        let cr1 = Control1::TABLE_SH_IS
            | Control1::TABLE_OC_WBC
            | Control1::TABLE_IC_WBC
            | Control1::QUEUE_SH_IS
            | Control1::QUEUE_OC_WBC
            | Control1::QUEUE_IC_WBC;
        regs.write32(SMMU_CR1, cr1.bits());

        let mut cr2 = Control2::PTM | Control2::RECINVSID;
        if self.features.hyp {
            cr2 |= Control2::E2H;
        }
        regs.write32(SMMU_CR2, cr2.bits());

        self.strtab.program(regs);

        self.cmdq.program();
        let mut cr0 = Control0::CMDQEN;
        write_ack(regs, SMMU_CR0, SMMU_CR0ACK, cr0.bits(), ack_timeout)?;

        self.cmdq.invalidate_all_sid();
        if self.features.hyp {
            self.cmdq.tlbi_el2_all();
        }
        self.cmdq.tlbi_all();

        self.evtq.program();
        cr0 |= Control0::EVENTQEN;
        write_ack(regs, SMMU_CR0, SMMU_CR0ACK, cr0.bits(), ack_timeout)?;

        if let Some(priq) = &self.priq {
            priq.program();
            cr0 |= Control0::PRIQEN;
            write_ack(regs, SMMU_CR0, SMMU_CR0ACK, cr0.bits(), ack_timeout)?;
        }

        if self.features.ats {
            cr0 |= Control0::ATSCHK;
            write_ack(regs, SMMU_CR0, SMMU_CR0ACK, cr0.bits(), ack_timeout)?;
        }

        let mut irq = IrqControl::EVENTQ_IRQEN | IrqControl::GERROR_IRQEN;
        if self.priq.is_some() {
            irq |= IrqControl::PRIQ_IRQEN;
        }
        write_ack(regs, SMMU_IRQ_CTRL, SMMU_IRQ_CTRLACK, irq.bits(), ack_timeout)?;

        cr0 |= Control0::SMMUEN;
        write_ack(regs, SMMU_CR0, SMMU_CR0ACK, cr0.bits(), ack_timeout)?;
        Ok(())
    }

    /// Disables interrupts and the unit. Translations stop; the memory is
    /// released when the last reference to the unit is dropped.
    pub fn detach(&self) -> Result<()> {
        if !self.domains.lock().is_empty() {
            warn!("{}: detaching with live domains", self.unit);
        }
        self.disable()?;
        info!("{}: detached", self.unit);
        Ok(())
    }

    /// Turns off interrupts and every queue. Both writes are attempted even
    /// if the first one is not acknowledged.
    fn disable(&self) -> Result<()> {
        let regs = self.regs.as_ref();
        let ack_timeout = self.options.ack_timeout;
        let irq = write_ack(regs, SMMU_IRQ_CTRL, SMMU_IRQ_CTRLACK, 0, ack_timeout);
        let cr0 = write_ack(regs, SMMU_CR0, SMMU_CR0ACK, 0, ack_timeout);
        irq.and(cr0)
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn xref(&self) -> u64 {
        self.unit.0
    }

    pub fn features(&self) -> &SmmuFeatures {
        &self.features
    }

    pub fn stream_table(&self) -> &StreamTable {
        &self.strtab
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.cmdq
    }

    /// The input address size of the domains' page tables.
    pub fn ias(&self) -> u32 {
        self.features.va_bits.min(CD_MAX_IAS)
    }

    pub fn domains(&self) -> Vec<Arc<SmmuDomain>> {
        self.domains.lock().clone()
    }

    /// Creates a domain translating through `page_table`, which must be
    /// freshly initialized.
    pub fn domain_alloc(&self, page_table: Box<dyn IoPageTable>) -> Result<Arc<SmmuDomain>> {
        let asid = self.asids.lock().alloc().ok_or(SmmuError::NoAsid)?;
        // The pool never holds more than 2^16 IDs.
        let asid = asid as u16;

        let cd = match ContextDescriptor::init(
            &self.memory,
            asid,
            page_table.root_paddr(),
            self.ias(),
        ) {
            Ok(cd) => cd,
            Err(err) => {
                self.asids.lock().free(asid as usize);
                return Err(err);
            }
        };

        // The ASID may have been used by a domain that has since been freed.
        self.cmdq.tlbi_asid(asid);

        let domain = Arc::new(SmmuDomain::new(asid, page_table, cd));
        self.domains.lock().push(domain.clone());
        debug!("{}: domain with ASID {} created", self.unit, asid);
        Ok(domain)
    }

    /// Destroys a domain that no context is bound to.
    pub fn domain_free(&self, domain: &Arc<SmmuDomain>) -> Result<()> {
        if domain.num_contexts() != 0 {
            return Err(SmmuError::Busy);
        }
        {
            let mut domains = self.domains.lock();
            let pos = domains
                .iter()
                .position(|d| Arc::ptr_eq(d, domain))
                .ok_or(SmmuError::AlreadyFreed)?;
            domains.swap_remove(pos);
        }

        // Tear the tables down before the ASID can be reused.
        domain.page_table().remove_all();
        domain.page_table().release();
        self.cmdq.tlbi_asid(domain.asid());
        self.asids.lock().free(domain.asid() as usize);
        drop(domain.take_cd());

        debug!("{}: domain with ASID {} freed", self.unit, domain.asid());
        Ok(())
    }

    /// Creates the context of `device` in `domain`, without programming
    /// the stream table yet.
    ///
    /// A bypass context lets the device's traffic through untranslated.
    pub fn ctx_alloc(
        &self,
        domain: &Arc<SmmuDomain>,
        device: IommuDevice,
        bypass: bool,
    ) -> Result<Arc<SmmuContext>> {
        let sid = self.resolve_sid(&device)?;
        self.strtab.get_ste_addr(sid)?;

        let ctx = Arc::new(SmmuContext::new(device, sid, bypass, domain));
        domain.contexts_locked().push(ctx.clone());
        Ok(ctx)
    }

    /// Programs the STEs of the context.
    ///
    /// For a bus-wide PCI device, every function on the bus gets the same
    /// STE. If that fails midway, the STEs already written stay in place
    /// and are recorded in the context, so that [`ctx_free`] still clears
    /// them.
    ///
    /// The context state is not locked while the STEs are written, so the
    /// event handler can still look the context up.
    ///
    /// [`ctx_free`]: Self::ctx_free
    pub fn ctx_init(&self, ctx: &SmmuContext) -> Result<()> {
        let domain = ctx.domain().ok_or(SmmuError::AlreadyFreed)?;
        if *ctx.state() == ContextState::Freed {
            return Err(SmmuError::AlreadyFreed);
        }
        let cd_paddr = domain.cd_paddr().ok_or(SmmuError::AlreadyFreed)?;

        let mut sids = StreamIds::new();
        let result = self.for_each_sid(ctx, |sid| {
            if ctx.is_bypass() {
                self.strtab.init_ste_bypass(&self.cmdq, sid)?;
            } else {
                self.strtab.init_ste_s1(&self.cmdq, cd_paddr, sid)?;
            }
            sids.push(sid);
            Ok(())
        });
        if sids.is_empty() {
            return result;
        }

        {
            let mut state = ctx.state();
            if *state != ContextState::Freed {
                *state = ContextState::Bound(sids);
                return result;
            }
        }
        // Freed while the STEs were written.
        for sid in sids {
            self.strtab.deinit_ste(&self.cmdq, sid)?;
        }
        Err(SmmuError::AlreadyFreed)
    }

    /// Invalidates the STEs of the context and unbinds it from its domain.
    ///
    /// The caller serializes this against other operations on the domain.
    pub fn ctx_free(&self, ctx: &Arc<SmmuContext>) -> Result<()> {
        let sids = {
            let mut state = ctx.state();
            match core::mem::replace(&mut *state, ContextState::Freed) {
                ContextState::Freed => return Err(SmmuError::AlreadyFreed),
                ContextState::Created => StreamIds::new(),
                ContextState::Bound(sids) => sids,
            }
        };

        for sid in sids {
            self.strtab.deinit_ste(&self.cmdq, sid)?;
        }

        if let Some(domain) = ctx.domain() {
            domain.contexts_locked().retain(|c| !Arc::ptr_eq(c, ctx));
        }
        Ok(())
    }

    /// Finds the context whose STEs include `sid`.
    pub fn ctx_lookup_by_sid(&self, sid: u32) -> Option<Arc<SmmuContext>> {
        let domains = self.domains.lock();
        domains.iter().find_map(|domain| {
            domain
                .contexts_locked()
                .iter()
                .find(|ctx| ctx.covers_sid(sid))
                .cloned()
        })
    }

    /// Like [`ctx_lookup_by_sid`](Self::ctx_lookup_by_sid), without waiting
    /// for any lock. Contexts behind a busy lock are skipped.
    fn try_ctx_lookup_by_sid(&self, sid: u32) -> Option<Arc<SmmuContext>> {
        let domains = self.domains.try_lock()?;
        domains.iter().find_map(|domain| {
            domain
                .try_contexts_locked()?
                .iter()
                .find(|ctx| ctx.try_covers_sid(sid) == Some(true))
                .cloned()
        })
    }

    /// Maps `size` bytes at `va` to `pages`, one frame per page.
    ///
    /// Nothing is entered if `pages` holds fewer frames than the range
    /// needs.
    ///
    /// The TLB invalidations are completed by a single `CMD_SYNC` once the
    /// whole range is entered, also when entering a page fails. Pages
    /// entered before the failure stay mapped.
    pub fn map(
        &self,
        domain: &SmmuDomain,
        va: Daddr,
        pages: &[Paddr],
        size: usize,
        prot: IoProt,
    ) -> Result<()> {
        let count = Self::page_count(va, size)?;
        if pages.len() < count {
            warn!("{}: {} pages for {:#x} bytes", self.unit, pages.len(), size);
            return Err(SmmuError::InvalidArgument);
        }

        let mut result = Ok(());
        for (i, paddr) in pages.iter().take(count).enumerate() {
            let daddr = va + i * PAGE_SIZE;
            if let Err(err) = domain.page_table().enter(daddr, *paddr, prot) {
                result = Err(err.into());
                break;
            }
            self.cmdq.tlbi_va(domain.asid(), daddr as u64);
        }
        self.cmdq.sync();
        result
    }

    /// Unmaps `size` bytes at `va`, stopping at the first page that is not
    /// mapped.
    pub fn unmap(&self, domain: &SmmuDomain, va: Daddr, size: usize) -> Result<()> {
        let count = Self::page_count(va, size)?;

        let mut result = Ok(());
        for i in 0..count {
            let daddr = va + i * PAGE_SIZE;
            if let Err(err) = domain.page_table().remove(daddr) {
                result = Err(err.into());
                break;
            }
            self.cmdq.tlbi_va(domain.asid(), daddr as u64);
        }
        self.cmdq.sync();
        result
    }

    /// Handles the event queue interrupt.
    ///
    /// The handler may interrupt a thread that holds any of the unit's
    /// locks, so it never waits for one. An event whose device cannot be
    /// looked up without waiting is reported as if the device were unknown.
    pub fn handle_event_irq(&self) -> EventQueueReport {
        let report = self.evtq.drain(|record| {
            let device = self
                .try_ctx_lookup_by_sid(record.sid)
                .and_then(|ctx| ctx.device().pci_id());
            if is_suppressed(device, record) {
                return true;
            }
            self.log_event(record);
            false
        });
        if report.overflowed {
            warn!("{}: event queue overflowed, events were lost", self.unit);
        }
        report
    }

    /// Handles the global error interrupt and returns the errors that were
    /// active.
    pub fn handle_gerror_irq(&self) -> GlobalError {
        let gerror = self.regs.read32(SMMU_GERROR);
        let gerrorn = self.regs.read32(SMMU_GERRORN);
        let active = GlobalError::from_bits_truncate(gerror ^ gerrorn);
        if active.is_empty() {
            return active;
        }

        error!("{}: global error {:#x}", self.unit, active.bits());
        for (bit, description) in GlobalError::DESCRIPTIONS {
            if active.contains(bit) {
                error!("{}:   {}", self.unit, description);
            }
        }
        if active.contains(GlobalError::CMDQ_ERR) {
            self.cmdq.log_error_command();
        }

        self.regs.write32(SMMU_GERRORN, gerror);
        active
    }

    /// Handles the page request queue interrupt and returns the number of
    /// requests.
    pub fn handle_priq_irq(&self) -> usize {
        let Some(priq) = &self.priq else {
            return 0;
        };
        let (count, overflowed) = priq.drain(|request| {
            warn!(
                "{}: unexpected page request from stream {:#x}: {:#x?}",
                self.unit, request.sid, request
            );
        });
        if overflowed {
            warn!("{}: page request queue overflowed", self.unit);
        }
        count
    }

    fn log_event(&self, record: &EventRecord) {
        match record.event_type() {
            Some(ty) => error!(
                "{}: event {:#x} {} ({}): stream {:#x}, address {:#x}, IPA {:#x}, {}",
                self.unit,
                record.id,
                ty.name,
                ty.description,
                record.sid,
                record.input_addr,
                record.ipa,
                if record.read { "read" } else { "write" }
            ),
            None => error!(
                "{}: unknown event {:#x}: stream {:#x}, raw {:#x?}",
                self.unit, record.id, record.sid, record.raw
            ),
        }
        if let Some(ssid) = record.ssid {
            error!("{}:   substream {:#x}", self.unit, ssid);
        }
        if let Some(ste) = self.strtab.try_lookup(record.sid) {
            debug!("{}:   STE {:#x?}", self.unit, ste.dwords());
        }
    }

    fn resolve_sid(&self, device: &IommuDevice) -> Result<u32> {
        match device {
            IommuDevice::Pci { location, .. } => self
                .stream_ids
                .pci_stream_id(location.rid())
                .ok_or(SmmuError::NoStreamId),
            IommuDevice::Platform { stream_id } => Ok(*stream_id),
        }
    }

    /// Calls `f` with every stream ID the context covers.
    fn for_each_sid<F>(&self, ctx: &SmmuContext, mut f: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<()>,
    {
        match ctx.device() {
            IommuDevice::Pci {
                location,
                buswide: true,
                ..
            } => {
                for function in PciDeviceLocation::all_on_bus(location.bus) {
                    let sid = self
                        .stream_ids
                        .pci_stream_id(function.rid())
                        .ok_or(SmmuError::NoStreamId)?;
                    f(sid)?;
                }
                Ok(())
            }
            _ => f(ctx.sid()),
        }
    }

    fn page_count(va: Daddr, size: usize) -> Result<usize> {
        if va % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(PageTableError::Unaligned.into());
        }
        Ok(size / PAGE_SIZE)
    }
}

impl fmt::Debug for Smmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Smmu")
            .field("unit", &self.unit)
            .field("features", &self.features)
            .field("num_domains", &self.domains.lock().len())
            .finish()
    }
}
