// SPDX-License-Identifier: MPL-2.0

//! A simulated SMMU and the memory it works on, for host tests.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use buddy_system_allocator::FrameAllocator;
use spin::Mutex;

use crate::{
    command::{Command, SyncCompletion},
    context::{IdentityStreamIdMap, StreamIdMap},
    dma::{Daddr, DmaMemory, Paddr},
    domain::{IoPageTable, IoProt},
    error::PageTableError,
    options::SmmuOptions,
    queue::{QueueIndexes, QUEUE_OVF},
    registers::*,
    smmu::{Smmu, SmmuResources},
    strtab::{Ste, STE_DWORDS},
};

const ARENA_BASE: Paddr = 0x8000_0000;
const ARENA_SIZE: usize = 8 << 20;
const GRANULE: usize = 64;

/// Physical memory backed by an array of words, handed out by a buddy
/// allocator in 64-byte granules.
pub(crate) struct MockMemory {
    words: Vec<AtomicU64>,
    allocator: Mutex<FrameAllocator<32>>,
    /// Live allocations: base address to number of granules.
    live: Mutex<BTreeMap<Paddr, usize>>,
    total_allocs: AtomicUsize,
    /// Number of allocations that may still succeed, if limited.
    alloc_budget: Mutex<Option<usize>>,
    write_log: Mutex<Option<Vec<(Paddr, u64)>>>,
}

impl MockMemory {
    pub(crate) fn new_arc() -> Arc<Self> {
        let mut allocator = FrameAllocator::<32>::new();
        allocator.add_frame(ARENA_BASE / GRANULE, (ARENA_BASE + ARENA_SIZE) / GRANULE);
        Arc::new(Self {
            words: (0..ARENA_SIZE / 8).map(|_| AtomicU64::new(0)).collect(),
            allocator: Mutex::new(allocator),
            live: Mutex::new(BTreeMap::new()),
            total_allocs: AtomicUsize::new(0),
            alloc_budget: Mutex::new(None),
            write_log: Mutex::new(None),
        })
    }

    pub(crate) fn is_allocated(&self, paddr: Paddr) -> bool {
        self.live.lock().contains_key(&paddr)
    }

    pub(crate) fn num_live(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn total_allocs(&self) -> usize {
        self.total_allocs.load(Ordering::Relaxed)
    }

    /// Lets only the next `count` allocations succeed.
    pub(crate) fn limit_allocations(&self, count: usize) {
        *self.alloc_budget.lock() = Some(count);
    }

    /// Records every word written through [`DmaMemory::write_u64`] from now on.
    pub(crate) fn start_write_log(&self) {
        *self.write_log.lock() = Some(Vec::new());
    }

    pub(crate) fn take_write_log(&self) -> Vec<(Paddr, u64)> {
        self.write_log.lock().take().unwrap_or_default()
    }

    /// A write by the simulated device, which is not logged.
    fn poke(&self, paddr: Paddr, value: u64) {
        self.word(paddr).store(value, Ordering::SeqCst);
    }

    fn peek(&self, paddr: Paddr) -> u64 {
        self.word(paddr).load(Ordering::SeqCst)
    }

    fn word(&self, paddr: Paddr) -> &AtomicU64 {
        assert!(
            paddr >= ARENA_BASE && paddr + 8 <= ARENA_BASE + ARENA_SIZE && paddr % 8 == 0,
            "bad physical address {:#x}",
            paddr
        );
        &self.words[(paddr - ARENA_BASE) / 8]
    }
}

impl DmaMemory for MockMemory {
    fn alloc_zeroed(&self, size: usize, align: usize) -> Option<Paddr> {
        if let Some(budget) = self.alloc_budget.lock().as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }

        let granules = size
            .div_ceil(GRANULE)
            .max(align.div_ceil(GRANULE))
            .next_power_of_two();
        let frame = self.allocator.lock().alloc(granules)?;
        let paddr = frame * GRANULE;
        assert_eq!(paddr % align, 0);

        for offset in (0..granules * GRANULE).step_by(8) {
            self.poke(paddr + offset, 0);
        }
        self.live.lock().insert(paddr, granules);
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        Some(paddr)
    }

    fn dealloc(&self, paddr: Paddr, _size: usize) {
        let granules = self
            .live
            .lock()
            .remove(&paddr)
            .expect("freeing memory that is not allocated");
        self.allocator.lock().dealloc(paddr / GRANULE, granules);
    }

    fn read_u64(&self, paddr: Paddr) -> u64 {
        self.peek(paddr)
    }

    fn write_u64(&self, paddr: Paddr, value: u64) {
        if let Some(log) = self.write_log.lock().as_mut() {
            log.push((paddr, value));
        }
        self.poke(paddr, value);
    }
}

/// The ID registers the simulated SMMU reports.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MockIdRegisters {
    pub idr0: u32,
    pub idr1: u32,
    pub idr5: u32,
}

impl MockIdRegisters {
    const IDR0_ST_LEVEL_2LVL: u32 = 1 << 27;
    const IDR0_TTF_AARCH64: u32 = 0b10 << 2;
    const IDR0_S1P: u32 = 1 << 1;
    const IDR0_PRI: u32 = 1 << 16;
    const IDR0_ASID16: u32 = 1 << 12;
    const IDR0_HYP: u32 = 1 << 9;
    const IDR0_MSI: u32 = 1 << 13;
    const IDR1_QUEUES: u32 = (8 << 21) | (7 << 16) | (7 << 11);
    /// 48-bit output addresses, 4 KiB granule.
    const IDR5: u32 = 5 | (1 << 4);

    /// A two-level-capable unit with 16-bit stream IDs and 8-bit ASIDs.
    pub(crate) fn two_level() -> Self {
        Self {
            idr0: Self::IDR0_ST_LEVEL_2LVL
                | Self::IDR0_TTF_AARCH64
                | Self::IDR0_S1P
                | Self::IDR0_MSI,
            idr1: Self::IDR1_QUEUES | 16,
            idr5: Self::IDR5,
        }
    }

    /// A unit with an 8-bit stream ID space, which uses a linear table.
    pub(crate) fn linear() -> Self {
        Self {
            idr0: Self::IDR0_TTF_AARCH64 | Self::IDR0_S1P | Self::IDR0_MSI,
            idr1: Self::IDR1_QUEUES | 8,
            idr5: Self::IDR5,
        }
    }

    pub(crate) fn with_pri(mut self) -> Self {
        self.idr0 |= Self::IDR0_PRI;
        self
    }

    pub(crate) fn with_asid16(mut self) -> Self {
        self.idr0 |= Self::IDR0_ASID16;
        self
    }

    pub(crate) fn with_hyp(mut self) -> Self {
        self.idr0 |= Self::IDR0_HYP;
        self
    }

    pub(crate) fn without_msi(mut self) -> Self {
        self.idr0 &= !Self::IDR0_MSI;
        self
    }
}

#[derive(Default)]
struct MockState {
    regs: BTreeMap<usize, u64>,
    commands: Vec<Command>,
    ste_snapshots: Vec<(u32, Ste)>,
    hang_sync: bool,
    stuck_ack: bool,
    /// `SMMU_CR0` values with any of these bits are not acknowledged.
    refused_cr0: u32,
}

/// A register window that behaves like an SMMU: control writes are
/// acknowledged, commands are consumed as soon as the producer index moves,
/// and `CMD_SYNC` completes with an MSI write.
pub(crate) struct MockSmmu {
    ids: MockIdRegisters,
    memory: Arc<MockMemory>,
    state: Mutex<MockState>,
}

impl MockSmmu {
    pub(crate) fn new(ids: MockIdRegisters, memory: Arc<MockMemory>) -> Arc<Self> {
        Arc::new(Self {
            ids,
            memory,
            state: Mutex::new(MockState::default()),
        })
    }

    /// Every command consumed so far.
    pub(crate) fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    pub(crate) fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// The STE of each `CMD_CFGI_STE`, as seen when it was consumed.
    pub(crate) fn ste_snapshots(&self) -> Vec<(u32, Ste)> {
        self.state.lock().ste_snapshots.clone()
    }

    pub(crate) fn clear_ste_snapshots(&self) {
        self.state.lock().ste_snapshots.clear();
    }

    /// Stops completing `CMD_SYNC`.
    pub(crate) fn set_hang_sync(&self, hang: bool) {
        self.state.lock().hang_sync = hang;
    }

    /// Stops acknowledging control register writes.
    pub(crate) fn set_stuck_ack(&self, stuck: bool) {
        self.state.lock().stuck_ack = stuck;
    }

    /// Stops acknowledging `SMMU_CR0` writes that set any of `bits`.
    pub(crate) fn refuse_cr0(&self, bits: Control0) {
        self.state.lock().refused_cr0 = bits.bits();
    }

    pub(crate) fn reg(&self, offset: usize) -> u64 {
        self.state.lock().regs.get(&offset).copied().unwrap_or(0)
    }

    /// Raises the global errors in `errors`.
    pub(crate) fn raise_gerror(&self, errors: GlobalError) {
        let mut state = self.state.lock();
        *state.regs.entry(SMMU_GERROR).or_default() ^= errors.bits() as u64;
    }

    /// Sets the error field of `SMMU_CMDQ_CONS`.
    pub(crate) fn set_cmdq_error(&self, err: u32) {
        let mut state = self.state.lock();
        let cons = state.regs.entry(SMMU_CMDQ_CONS).or_default();
        *cons = (*cons & !(CMDQ_CONS_ERR_MASK as u64)) | ((err << CMDQ_CONS_ERR_SHIFT) as u64);
    }

    /// Appends an event record; returns false if the queue was full and the
    /// record was lost.
    pub(crate) fn inject_event(&self, raw: [u64; 4]) -> bool {
        let mut state = self.state.lock();
        self.produce(&mut state, SMMU_EVENTQ_BASE, SMMU_EVENTQ_PROD, SMMU_EVENTQ_CONS, &raw)
    }

    /// Appends a page request; returns false if it was lost.
    pub(crate) fn inject_page_request(&self, raw: [u64; 2]) -> bool {
        let mut state = self.state.lock();
        self.produce(&mut state, SMMU_PRIQ_BASE, SMMU_PRIQ_PROD, SMMU_PRIQ_CONS, &raw)
    }

    fn produce(
        &self,
        state: &mut MockState,
        base_reg: usize,
        prod_reg: usize,
        cons_reg: usize,
        entry: &[u64],
    ) -> bool {
        let (addr, log2) = Self::queue_base(state, base_reg);
        let mut indexes = QueueIndexes::new(log2);
        indexes.set_prod(Self::reg_of(state, prod_reg) as u32);
        indexes.set_cons(Self::reg_of(state, cons_reg) as u32);

        if !indexes.has_space() {
            if !indexes.has_overflowed() {
                state
                    .regs
                    .insert(prod_reg, (indexes.prod() ^ QUEUE_OVF) as u64);
            }
            return false;
        }

        let slot = addr + indexes.prod_index() * entry.len() * 8;
        for (i, dword) in entry.iter().enumerate() {
            self.memory.poke(slot + i * 8, *dword);
        }
        indexes.inc_prod();
        state.regs.insert(prod_reg, indexes.prod() as u64);
        true
    }

    fn consume_commands(&self, state: &mut MockState) {
        let (addr, log2) = Self::queue_base(state, SMMU_CMDQ_BASE);
        let mut indexes = QueueIndexes::new(log2);
        indexes.set_prod(Self::reg_of(state, SMMU_CMDQ_PROD) as u32);
        indexes.set_cons(Self::reg_of(state, SMMU_CMDQ_CONS) as u32);

        while !indexes.is_empty() {
            let slot = addr + indexes.cons_index() * 16;
            let entry = [self.memory.peek(slot), self.memory.peek(slot + 8)];
            let cmd = Command::decode(&entry).expect("malformed command");

            match cmd {
                Command::Sync {
                    completion: SyncCompletion::Msi { addr, data },
                } if !state.hang_sync => {
                    let old = self.memory.peek(addr);
                    self.memory.poke(addr, (old & !0xffff_ffff) | data as u64);
                }
                Command::CfgiSte { sid, .. } => {
                    if let Some(ste) = self.read_ste(state, sid) {
                        state.ste_snapshots.push((sid, ste));
                    }
                }
                _ => {}
            }
            state.commands.push(cmd);
            indexes.inc_cons();
        }
        state.regs.insert(SMMU_CMDQ_CONS, indexes.cons() as u64);
    }

    fn read_ste(&self, state: &MockState, sid: u32) -> Option<Ste> {
        let base = Self::reg_of(state, SMMU_STRTAB_BASE) & STRTAB_BASE_ADDR_MASK;
        let cfg = Self::reg_of(state, SMMU_STRTAB_BASE_CFG);
        let log2 = cfg & 0x3f;
        let split = (cfg >> STRTAB_BASE_CFG_SPLIT_SHIFT) & 0x1f;
        if sid as u64 >= 1 << log2 {
            return None;
        }

        let ste_addr = if cfg & STRTAB_BASE_CFG_FMT_2LVL as u64 == 0 {
            base + sid as u64 * 64
        } else {
            let desc = self.memory.peek((base + (sid as u64 >> split) * 8) as Paddr);
            if desc & 0x1f == 0 {
                return None;
            }
            (desc & 0x000f_ffff_ffff_ffc0) + (sid as u64 & ((1 << split) - 1)) * 64
        };

        let mut dwords = [0u64; STE_DWORDS];
        for (i, dword) in dwords.iter_mut().enumerate() {
            *dword = self.memory.peek(ste_addr as Paddr + i * 8);
        }
        Some(Ste::from_dwords(dwords))
    }

    fn queue_base(state: &MockState, base_reg: usize) -> (Paddr, u32) {
        let base = Self::reg_of(state, base_reg);
        ((base & 0x000f_ffff_ffff_ffe0) as Paddr, (base & 0x1f) as u32)
    }

    fn reg_of(state: &MockState, offset: usize) -> u64 {
        state.regs.get(&offset).copied().unwrap_or(0)
    }
}

impl RegisterWindow for MockSmmu {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            SMMU_IDR0 => self.ids.idr0,
            SMMU_IDR1 => self.ids.idr1,
            SMMU_IDR5 => self.ids.idr5,
            SMMU_CR0ACK => {
                let cr0 = Self::reg_of(&state, SMMU_CR0) as u32;
                if state.stuck_ack || cr0 & state.refused_cr0 != 0 {
                    0xdead
                } else {
                    cr0
                }
            }
            SMMU_IRQ_CTRLACK if state.stuck_ack => 0xdead,
            SMMU_IRQ_CTRLACK => Self::reg_of(&state, SMMU_IRQ_CTRL) as u32,
            _ => Self::reg_of(&state, offset) as u32,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        state.regs.insert(offset, value as u64);

        let cmdq_enabled = Self::reg_of(&state, SMMU_CR0) as u32 & Control0::CMDQEN.bits() != 0;
        if offset == SMMU_CMDQ_PROD && cmdq_enabled {
            self.consume_commands(&mut state);
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        Self::reg_of(&self.state.lock(), offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.state.lock().regs.insert(offset, value);
    }
}

/// A page table that records its mappings instead of building descriptors.
pub(crate) struct MockPageTable {
    root: Paddr,
    mappings: Arc<Mutex<BTreeMap<Daddr, (Paddr, IoProt)>>>,
    /// Number of `enter` calls that may still succeed, if limited.
    enter_budget: Mutex<Option<usize>>,
    released: Arc<AtomicUsize>,
}

/// A view of a [`MockPageTable`] that outlives the box handed to a domain.
#[derive(Clone)]
pub(crate) struct MockPageTableProbe {
    mappings: Arc<Mutex<BTreeMap<Daddr, (Paddr, IoProt)>>>,
    released: Arc<AtomicUsize>,
}

impl MockPageTableProbe {
    pub(crate) fn mapping(&self, daddr: Daddr) -> Option<(Paddr, IoProt)> {
        self.mappings.lock().get(&daddr).copied()
    }

    pub(crate) fn num_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::Relaxed) != 0
    }
}

impl MockPageTable {
    pub(crate) fn new(root: Paddr) -> (Box<dyn IoPageTable>, MockPageTableProbe) {
        Self::with_enter_budget(root, None)
    }

    pub(crate) fn with_enter_budget(
        root: Paddr,
        budget: Option<usize>,
    ) -> (Box<dyn IoPageTable>, MockPageTableProbe) {
        let mappings = Arc::new(Mutex::new(BTreeMap::new()));
        let released = Arc::new(AtomicUsize::new(0));
        let table = Self {
            root,
            mappings: mappings.clone(),
            enter_budget: Mutex::new(budget),
            released: released.clone(),
        };
        (Box::new(table), MockPageTableProbe { mappings, released })
    }
}

impl IoPageTable for MockPageTable {
    fn root_paddr(&self) -> Paddr {
        self.root
    }

    fn enter(&self, daddr: Daddr, paddr: Paddr, prot: IoProt) -> Result<(), PageTableError> {
        if let Some(budget) = self.enter_budget.lock().as_mut() {
            if *budget == 0 {
                return Err(PageTableError::NoMemory);
            }
            *budget -= 1;
        }
        let mut mappings = self.mappings.lock();
        if mappings.contains_key(&daddr) {
            return Err(PageTableError::AlreadyMapped);
        }
        mappings.insert(daddr, (paddr, prot));
        Ok(())
    }

    fn remove(&self, daddr: Daddr) -> Result<(), PageTableError> {
        self.mappings
            .lock()
            .remove(&daddr)
            .map(|_| ())
            .ok_or(PageTableError::NotMapped)
    }

    fn remove_all(&self) {
        self.mappings.lock().clear();
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// An attached unit together with its simulated hardware.
pub(crate) struct TestUnit {
    pub smmu: Arc<Smmu>,
    pub hw: Arc<MockSmmu>,
    pub memory: Arc<MockMemory>,
}

pub(crate) fn attach(ids: MockIdRegisters, options: SmmuOptions) -> TestUnit {
    let (smmu, hw, memory) = try_attach(ids, options, Arc::new(IdentityStreamIdMap), 0x1000);
    TestUnit {
        smmu: smmu.unwrap(),
        hw,
        memory,
    }
}

/// Attaches a unit without insisting that it succeeds.
pub(crate) fn try_attach(
    ids: MockIdRegisters,
    options: SmmuOptions,
    stream_ids: Arc<dyn StreamIdMap>,
    xref: u64,
) -> (crate::Result<Arc<Smmu>>, Arc<MockSmmu>, Arc<MockMemory>) {
    let memory = MockMemory::new_arc();
    let hw = MockSmmu::new(ids, memory.clone());
    let smmu = Smmu::attach(
        SmmuResources {
            regs: hw.clone(),
            memory: memory.clone(),
            stream_ids,
            xref,
        },
        options,
    );
    (smmu, hw, memory)
}
