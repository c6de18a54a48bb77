use std::collections::{HashMap, HashSet};

use pagewatch_arch_amd64::{Amd64, PageTableEntry, PageTableLevel, Registers};
use pagewatch_core::{
    Architecture as _, CpuId, CpuOperation, FaultFlags, FaultOutcome, KernelInfo, MemoryAccess,
    Pa, Pfn, Pid, PteFault, Region, Registers as _, SharedHooks, Signal, SignalSet, TaskId, Va,
};
use zerocopy::{FromBytes as _, IntoBytes as _};

use crate::{Access, Error};

pub(crate) const PAGE_SIZE: u64 = Amd64::PAGE_SIZE;
const MAX_PFN: Pfn = Pfn(0xf_ffff);
const FIRST_PFN: u64 = 0x100;

pub(crate) const USER_ENABLE_SINGLE_STEP: &str = "user_enable_single_step";
pub(crate) const USER_DISABLE_SINGLE_STEP: &str = "user_disable_single_step";
pub(crate) const HANDLE_PTE_FAULT: &str = "handle_pte_fault";
pub(crate) const ARCH_DO_SIGNAL_OR_RESTART: &str = "arch_do_signal_or_restart";

const SYMBOLS: [(&str, Va); 4] = [
    (USER_ENABLE_SINGLE_STEP, Va(0xffff_ffff_8104_2a10)),
    (USER_DISABLE_SINGLE_STEP, Va(0xffff_ffff_8104_2ae0)),
    (HANDLE_PTE_FAULT, Va(0xffff_ffff_812c_8f30)),
    (ARCH_DO_SIGNAL_OR_RESTART, Va(0xffff_ffff_8103_b6c0)),
];

/// Machine-level event counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimCounters {
    /// Number of `FlushTlbAll` broadcasts.
    pub tlb_flushes: u64,

    /// Number of `InvalidateCaches` broadcasts.
    pub cache_invalidations: u64,

    /// Number of raw leaf-entry writes made through the driver.
    pub entry_writes: u64,

    /// Number of page faults raised.
    pub faults: u64,

    /// Number of single-step traps raised.
    pub traps: u64,
}

pub(crate) struct Task {
    pid: Pid,
    root: Pfn,
    regions: Vec<Region>,
    pub(crate) registers: Registers,
    pending: SignalSet,
    sigpending: bool,
    delivered: Vec<Signal>,
    cpu: CpuId,
}

/// The result of a leaf-level walk.
pub(crate) enum Walk {
    /// Every table above the leaf is present. Holds the leaf value.
    Leaf(PageTableEntry),

    /// A table above the leaf is missing.
    Incomplete,
}

/// The result of translating one access.
pub(crate) enum Translation {
    Mapped(Pa),
    Fault(PteFault),
    Segv,
}

type Tlb = HashMap<(Pfn, Va), PageTableEntry>;

pub(crate) struct Machine {
    pages: HashMap<Pfn, Vec<u8>>,
    next_pfn: u64,
    allocation_limit: Option<usize>,
    pins: HashMap<Pfn, usize>,
    tasks: HashMap<TaskId, Task>,
    next_task: u64,
    current: Option<TaskId>,
    tlbs: Vec<Tlb>,
    symbols: HashMap<String, Va>,
    intercepted: HashMap<String, SharedHooks<Amd64>>,
    refused: HashSet<String>,
    failing_entry_writes: bool,
    pub(crate) counters: SimCounters,
}

impl Machine {
    pub(crate) fn new(cpus: u16) -> Self {
        Self {
            pages: HashMap::new(),
            next_pfn: FIRST_PFN,
            allocation_limit: None,
            pins: HashMap::new(),
            tasks: HashMap::new(),
            next_task: 1,
            current: None,
            tlbs: (0..cpus.max(1)).map(|_| Tlb::new()).collect(),
            symbols: SYMBOLS
                .iter()
                .map(|&(name, va)| (name.to_owned(), va))
                .collect(),
            intercepted: HashMap::new(),
            refused: HashSet::new(),
            failing_entry_writes: false,
            counters: SimCounters::default(),
        }
    }

    pub(crate) fn info(&self) -> KernelInfo {
        KernelInfo {
            page_size: PAGE_SIZE,
            page_shift: Amd64::PAGE_SHIFT,
            max_pfn: MAX_PFN,
            cpus: self.tlbs.len() as u16,
            page_table_levels: 4,
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Physical memory
    ///////////////////////////////////////////////////////////////////////////

    fn alloc_frame(&mut self) -> Pfn {
        let pfn = Pfn(self.next_pfn);
        self.next_pfn += 1;
        self.pages.insert(pfn, vec![0; PAGE_SIZE as usize]);
        pfn
    }

    pub(crate) fn allocate(&mut self) -> Result<Pfn, Error> {
        if let Some(remaining) = &mut self.allocation_limit {
            if *remaining == 0 {
                return Err(Error::OutOfMemory);
            }

            *remaining -= 1;
        }

        Ok(self.alloc_frame())
    }

    pub(crate) fn free(&mut self, pfn: Pfn) -> Result<(), Error> {
        if self.pin_count(pfn) > 0 {
            return Err(Error::PagePinned(pfn));
        }

        self.pages
            .remove(&pfn)
            .map(drop)
            .ok_or(Error::PageNotFound(pfn))
    }

    pub(crate) fn fail_entry_writes(&mut self, fail: bool) {
        self.failing_entry_writes = fail;
    }

    pub(crate) fn set_allocation_limit(&mut self, limit: Option<usize>) {
        self.allocation_limit = limit;
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn page(&self, pfn: Pfn) -> Result<&[u8], Error> {
        self.pages
            .get(&pfn)
            .map(Vec::as_slice)
            .ok_or(Error::PageNotFound(pfn))
    }

    fn page_mut(&mut self, pfn: Pfn) -> Result<&mut [u8], Error> {
        self.pages
            .get_mut(&pfn)
            .map(Vec::as_mut_slice)
            .ok_or(Error::PageNotFound(pfn))
    }

    pub(crate) fn write(&mut self, pfn: Pfn, offset: u64, content: &[u8]) -> Result<(), Error> {
        let offset = offset as usize;
        self.page_mut(pfn)?
            .get_mut(offset..offset + content.len())
            .ok_or(Error::OutOfBounds)?
            .copy_from_slice(content);

        Ok(())
    }

    fn read_u64(&self, pa: Pa) -> Result<u64, Error> {
        let page = self.page(Amd64::pfn_from_pa(pa))?;
        let offset = Amd64::pa_offset(pa) as usize;

        let (value, _) =
            u64::read_from_prefix(&page[offset..]).map_err(|_| Error::OutOfBounds)?;

        Ok(value)
    }

    fn write_u64(&mut self, pa: Pa, value: u64) -> Result<(), Error> {
        self.write(Amd64::pfn_from_pa(pa), Amd64::pa_offset(pa), value.as_bytes())
    }

    pub(crate) fn write_entry(&mut self, entry: Pa, value: u64) -> Result<(), Error> {
        if self.failing_entry_writes {
            return Err(Error::EntryWriteFailed(entry));
        }

        self.write_u64(entry, value)?;
        self.counters.entry_writes += 1;
        Ok(())
    }

    pub(crate) fn pin(&mut self, task: TaskId, va: Va) -> Result<Pfn, Error> {
        let root = self.task(task)?.root;

        match self.walk(root, va)? {
            Walk::Leaf(value) if value.present() => {
                let pfn = value.pfn();
                *self.pins.entry(pfn).or_default() += 1;
                Ok(pfn)
            }
            _ => Err(Error::NotMapped(va)),
        }
    }

    pub(crate) fn unpin(&mut self, pfn: Pfn) -> Result<(), Error> {
        let count = self.pins.get_mut(&pfn).ok_or(Error::PageNotPinned(pfn))?;

        *count -= 1;
        if *count == 0 {
            self.pins.remove(&pfn);
        }

        Ok(())
    }

    pub(crate) fn pin_count(&self, pfn: Pfn) -> usize {
        self.pins.get(&pfn).copied().unwrap_or(0)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Tasks
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn spawn(&mut self, pid: Pid) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;

        let root = self.alloc_frame();
        self.tasks.insert(
            id,
            Task {
                pid,
                root,
                regions: Vec::new(),
                registers: Registers::default(),
                pending: SignalSet::empty(),
                sigpending: false,
                delivered: Vec::new(),
                cpu: CpuId(0),
            },
        );

        id
    }

    pub(crate) fn task(&self, id: TaskId) -> Result<&Task, Error> {
        self.tasks.get(&id).ok_or(Error::UnknownTask)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, Error> {
        self.tasks.get_mut(&id).ok_or(Error::UnknownTask)
    }

    pub(crate) fn find_task(&self, pid: Pid) -> Option<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, task)| task.pid == pid)
            .map(|(&id, _)| id)
            .min()
    }

    pub(crate) fn current(&self) -> Result<TaskId, Error> {
        self.current.ok_or(Error::NoCurrentTask)
    }

    pub(crate) fn set_current(&mut self, task: TaskId) -> Result<(), Error> {
        self.task(task)?;
        self.current = Some(task);
        Ok(())
    }

    pub(crate) fn migrate(&mut self, task: TaskId, cpu: CpuId) -> Result<(), Error> {
        if usize::from(cpu.0) >= self.tlbs.len() {
            return Err(Error::UnknownCpu);
        }

        self.task_mut(task)?.cpu = cpu;
        Ok(())
    }

    pub(crate) fn root(&self, task: TaskId) -> Result<Pa, Error> {
        Ok(Amd64::pa_from_pfn(self.task(task)?.root))
    }

    pub(crate) fn region(&self, task: TaskId, va: Va) -> Result<Option<Region>, Error> {
        let task = self.task(task)?;
        Ok(task.regions.iter().find(|region| region.contains(va)).copied())
    }

    pub(crate) fn add_region(
        &mut self,
        task: TaskId,
        start: Va,
        end: Va,
        protection: MemoryAccess,
    ) -> Result<(), Error> {
        self.task_mut(task)?.regions.push(Region {
            start,
            end,
            protection,
        });

        Ok(())
    }

    /// Maps one page of `content` at `va`, creating the page tables and a
    /// region for it as needed.
    pub(crate) fn map(
        &mut self,
        task: TaskId,
        va: Va,
        content: &[u8],
        protection: MemoryAccess,
    ) -> Result<Pfn, Error> {
        if content.len() as u64 > PAGE_SIZE {
            return Err(Error::OutOfBounds);
        }

        let va = Amd64::va_align_down(va);
        let root = self.task(task)?.root;

        if self.region(task, va)?.is_none() {
            self.add_region(task, va, va + PAGE_SIZE, protection)?;
        }

        let pmd = self.ensure_tables(root, va)?;
        let entry = self.leaf_from_pmd(pmd, va)?.ok_or(Error::NotMapped(va))?;

        let frame = self.alloc_frame();
        self.write(frame, 0, content)?;
        self.write_u64(entry, PageTableEntry::new(frame, protection).0)?;

        Ok(frame)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Paging
    ///////////////////////////////////////////////////////////////////////////

    fn entry_address(table: Pfn, va: Va, level: PageTableLevel) -> Pa {
        Amd64::pa_from_pfn(table)
            + Amd64::va_index_for(va, level) * size_of::<PageTableEntry>() as u64
    }

    pub(crate) fn walk(&self, root: Pfn, va: Va) -> Result<Walk, Error> {
        let mut table = root;
        let mut level = PageTableLevel::Pml4;

        loop {
            let entry = Self::entry_address(table, va, level);
            let value = PageTableEntry(self.read_u64(entry)?);

            let next = match level.next() {
                Some(next) => next,
                None => return Ok(Walk::Leaf(value)),
            };

            if !value.present() || value.large() {
                return Ok(Walk::Incomplete);
            }

            table = value.pfn();
            level = next;
        }
    }

    /// Allocates every missing table above the leaf and returns the address
    /// of the page directory entry.
    fn ensure_tables(&mut self, root: Pfn, va: Va) -> Result<Pa, Error> {
        let mut table = root;
        let mut level = PageTableLevel::Pml4;

        loop {
            let entry = Self::entry_address(table, va, level);
            let mut value = PageTableEntry(self.read_u64(entry)?);

            if !value.present() {
                value = PageTableEntry::new(self.alloc_frame(), MemoryAccess::RWX);
                self.write_u64(entry, value.0)?;
            }

            if level == PageTableLevel::Pd {
                return Ok(entry);
            }

            table = value.pfn();
            level = level.next().ok_or(Error::OutOfBounds)?;
        }
    }

    fn leaf_from_pmd(&self, pmd: Pa, va: Va) -> Result<Option<Pa>, Error> {
        let pde = PageTableEntry(self.read_u64(pmd)?);
        if !pde.present() || pde.large() {
            return Ok(None);
        }

        Ok(Some(Self::entry_address(pde.pfn(), va, PageTableLevel::Pt)))
    }

    /// Translates an access of the task through its CPU's TLB, walking the
    /// page tables on a miss. Only present entries are cached.
    pub(crate) fn translate(&mut self, task: TaskId, access: &Access) -> Result<Translation, Error> {
        let (root, cpu) = {
            let task = self.task(task)?;
            (task.root, usize::from(task.cpu.0))
        };

        let page = Amd64::va_align_down(access.address);
        let cached = self
            .tlbs
            .get(cpu)
            .ok_or(Error::UnknownCpu)?
            .get(&(root, page))
            .copied();

        let value = match cached {
            Some(value) => Some(value),
            None => match self.walk(root, access.address)? {
                Walk::Leaf(value) if value.present() => {
                    self.tlbs[cpu].insert((root, page), value);
                    Some(value)
                }
                _ => None,
            },
        };

        match value {
            Some(value) if access.kind.permitted(value) => Ok(Translation::Mapped(
                Amd64::pa_from_pfn(value.pfn()) + Amd64::va_offset(access.address),
            )),
            _ => self.fault(task, root, access),
        }
    }

    fn fault(&mut self, task: TaskId, root: Pfn, access: &Access) -> Result<Translation, Error> {
        if self.region(task, access.address)?.is_none() {
            return Ok(Translation::Segv);
        }

        let pmd = self.ensure_tables(root, access.address)?;
        self.counters.faults += 1;

        Ok(Translation::Fault(PteFault {
            address: Amd64::va_align_down(access.address),
            real_address: access.address,
            pmd,
            flags: access.kind.fault_flags(),
        }))
    }

    /// The kernel's own leaf-entry fault handler.
    ///
    /// Populates empty entries inside a region with a fresh zeroed page.
    /// Entries that are absent but not empty cannot be paged in and raise
    /// `SIGBUS`. Present entries that forbid the access raise `SIGSEGV`.
    pub(crate) fn handle_fault(
        &mut self,
        task: TaskId,
        fault: &PteFault,
    ) -> Result<FaultOutcome, Error> {
        let entry = match self.leaf_from_pmd(fault.pmd, fault.address)? {
            Some(entry) => entry,
            None => return Ok(FaultOutcome::SIGBUS),
        };

        let value = PageTableEntry(self.read_u64(entry)?);

        if value.0 == 0 {
            let region = match self.region(task, fault.address)? {
                Some(region) => region,
                None => return Ok(FaultOutcome::SIGSEGV),
            };

            let frame = match self.allocate() {
                Ok(frame) => frame,
                Err(_) => return Ok(FaultOutcome::OOM),
            };

            self.write_u64(entry, PageTableEntry::new(frame, region.protection).0)?;
            tracing::trace!(address = %fault.address, %frame, "demand paged");
            return Ok(FaultOutcome::HANDLED);
        }

        if !value.present() {
            return Ok(FaultOutcome::SIGBUS);
        }

        if (fault.flags.contains(FaultFlags::WRITE) && !value.write())
            || (fault.flags.contains(FaultFlags::INSTRUCTION) && value.execute_disable())
        {
            return Ok(FaultOutcome::SIGSEGV);
        }

        Ok(FaultOutcome::HANDLED)
    }

    pub(crate) fn leaf_value(&self, task: TaskId, va: Va) -> Result<Option<PageTableEntry>, Error> {
        let root = self.task(task)?.root;

        match self.walk(root, va)? {
            Walk::Leaf(value) => Ok(Some(value)),
            Walk::Incomplete => Ok(None),
        }
    }

    pub(crate) fn on_each_cpu(&mut self, operation: CpuOperation) {
        match operation {
            CpuOperation::FlushTlbAll => {
                self.tlbs.iter_mut().for_each(Tlb::clear);
                self.counters.tlb_flushes += 1;
            }
            CpuOperation::InvalidateCaches => self.counters.cache_invalidations += 1,
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Signals
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn raise(&mut self, task: TaskId, signal: Signal) -> Result<(), Error> {
        if signal == Signal::Trap {
            self.counters.traps += 1;
        }

        let task = self.task_mut(task)?;
        task.pending.insert(signal);
        task.sigpending = true;
        Ok(())
    }

    pub(crate) fn pending(&self, task: TaskId) -> Result<SignalSet, Error> {
        Ok(self.task(task)?.pending)
    }

    pub(crate) fn clear_pending(&mut self, task: TaskId, signal: Signal) -> Result<(), Error> {
        self.task_mut(task)?.pending.remove(signal);
        Ok(())
    }

    pub(crate) fn recalc_sigpending(&mut self, task: TaskId) -> Result<(), Error> {
        let task = self.task_mut(task)?;
        task.sigpending = !task.pending.is_empty();
        Ok(())
    }

    pub(crate) fn sigpending(&self, task: TaskId) -> Result<bool, Error> {
        Ok(self.task(task)?.sigpending)
    }

    /// Delivers every pending signal to user mode.
    pub(crate) fn deliver(&mut self, task: TaskId) -> Result<(), Error> {
        let task = self.task_mut(task)?;
        let pending = std::mem::take(&mut task.pending);

        task.delivered.extend(pending.iter());
        task.sigpending = false;
        Ok(())
    }

    pub(crate) fn delivered(&self, task: TaskId) -> Result<&[Signal], Error> {
        Ok(&self.task(task)?.delivered)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Symbols and interception
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn lookup(&self, name: &str) -> Option<Va> {
        self.symbols.get(name).copied()
    }

    pub(crate) fn remove_symbol(&mut self, name: &str) {
        self.symbols.remove(name);
    }

    pub(crate) fn call(&mut self, function: Va, task: TaskId) -> Result<(), Error> {
        let name = SYMBOLS
            .iter()
            .find(|(_, va)| *va == function)
            .map(|(name, _)| *name);

        let registers = &mut self.task_mut(task)?.registers;
        match name {
            Some(USER_ENABLE_SINGLE_STEP) => registers.set_single_step(true),
            Some(USER_DISABLE_SINGLE_STEP) => registers.set_single_step(false),
            _ => return Err(Error::UnknownFunction(function)),
        }

        Ok(())
    }

    pub(crate) fn intercept(
        &mut self,
        name: &str,
        replacement: SharedHooks<Amd64>,
    ) -> Result<Va, Error> {
        let original = match self.lookup(name) {
            Some(original) if !self.refused.contains(name) => original,
            _ => return Err(Error::HookRefused(name.to_owned())),
        };

        if self.intercepted.contains_key(name) {
            return Err(Error::HookRefused(name.to_owned()));
        }

        self.intercepted.insert(name.to_owned(), replacement);
        Ok(original)
    }

    pub(crate) fn release(&mut self, name: &str) -> Result<(), Error> {
        self.intercepted
            .remove(name)
            .map(drop)
            .ok_or_else(|| Error::NotHooked(name.to_owned()))
    }

    pub(crate) fn is_intercepted(&self, name: &str) -> bool {
        self.intercepted.contains_key(name)
    }

    /// Returns the replacement installed for `name`.
    pub(crate) fn replacement(&self, name: &str) -> Option<SharedHooks<Amd64>> {
        self.intercepted.get(name).cloned()
    }

    pub(crate) fn refuse(&mut self, name: &str) {
        self.refused.insert(name.to_owned());
    }
}
