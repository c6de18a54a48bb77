//! Simulated kernel driver.
//!
//! [`SimDriver`] is an in-memory machine that implements every collaborator
//! trait of the watchpoint machinery for AMD64:
//!
//! - physical memory with an optionally capped page allocator and pin counts,
//! - tasks with 4-level page tables, memory regions, a register frame, and
//!   pending and delivered signals,
//! - one TLB per CPU caching present leaf entries until the next
//!   `FlushTlbAll` broadcast,
//! - a symbol table and an interception table routing redirected kernel
//!   functions to their installed replacements.
//!
//! User-mode instructions are modelled as single memory accesses executed
//! with [`SimDriver::access`].

mod access;
mod error;
mod machine;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pagewatch_arch_amd64::{Amd64, PageTableEntry, Registers};
use pagewatch_core::{
    CpuId, CpuOperation, FunctionInterceptor, KernelDriver, KernelError, KernelInfo, MappedPage,
    MemoryAccess, Pa, Pfn, Pid, Region, SharedHooks, Signal, SignalSet, SymbolResolver, TaskId, Va,
};

pub use self::{
    access::{Access, AccessOutcome, AccessType},
    error::Error,
    machine::SimCounters,
};
use self::machine::Machine;

/// Simulated kernel driver.
///
/// Clones share the same machine.
#[derive(Clone)]
pub struct SimDriver {
    inner: Arc<Mutex<Machine>>,
}

impl SimDriver {
    /// The number of CPUs of a machine created with [`new`].
    ///
    /// [`new`]: Self::new
    pub const DEFAULT_CPUS: u16 = 2;

    /// Creates a machine with [`DEFAULT_CPUS`] CPUs.
    ///
    /// [`DEFAULT_CPUS`]: Self::DEFAULT_CPUS
    pub fn new() -> Self {
        Self::with_cpus(Self::DEFAULT_CPUS)
    }

    /// Creates a machine with the given number of CPUs.
    pub fn with_cpus(cpus: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Machine::new(cpus))),
        }
    }

    /// Creates a task with an empty address space, running on CPU 0.
    pub fn spawn(&self, pid: Pid) -> TaskId {
        self.lock().spawn(pid)
    }

    /// Maps one page holding `content` at `va`.
    ///
    /// Page tables are created as needed. If no region contains `va`, a
    /// region spanning the page is added with `protection`.
    pub fn map(
        &self,
        task: TaskId,
        va: Va,
        content: &[u8],
        protection: MemoryAccess,
    ) -> Result<Pfn, Error> {
        self.lock().map(task, va, content, protection)
    }

    /// Adds a memory region without populating it. Pages of the region are
    /// populated on first access.
    pub fn add_region(
        &self,
        task: TaskId,
        start: Va,
        end: Va,
        protection: MemoryAccess,
    ) -> Result<(), Error> {
        self.lock().add_region(task, start, end, protection)
    }

    /// Makes `task` the task executing on the current CPU.
    pub fn set_current(&self, task: TaskId) -> Result<(), Error> {
        self.lock().set_current(task)
    }

    /// Moves `task` to another CPU.
    pub fn migrate(&self, task: TaskId, cpu: CpuId) -> Result<(), Error> {
        self.lock().migrate(task, cpu)
    }

    /// Limits the number of pages [`allocate_page`] may still hand out.
    /// `None` removes the limit.
    ///
    /// Page tables and pages created by [`map`] are not subject to the
    /// limit.
    ///
    /// [`allocate_page`]: KernelDriver::allocate_page
    /// [`map`]: Self::map
    pub fn set_allocation_limit(&self, limit: Option<usize>) {
        self.lock().set_allocation_limit(limit);
    }

    /// Makes every raw page-table entry write fail until called again with
    /// `false`.
    pub fn fail_entry_writes(&self, fail: bool) {
        self.lock().fail_entry_writes(fail);
    }

    /// Queues a signal for the task, as `send_sig` would.
    pub fn send_signal(&self, task: TaskId, signal: Signal) -> Result<(), Error> {
        self.lock().raise(task, signal)
    }

    /// Makes every future interception of `name` fail.
    pub fn refuse_hook(&self, name: &str) {
        self.lock().refuse(name);
    }

    /// Removes a symbol from the symbol table.
    pub fn remove_symbol(&self, name: &str) {
        self.lock().remove_symbol(name);
    }

    /// Checks if `name` is intercepted.
    pub fn is_intercepted(&self, name: &str) -> bool {
        self.lock().is_intercepted(name)
    }

    /// Returns the event counters.
    pub fn counters(&self) -> SimCounters {
        self.lock().counters
    }

    /// Returns every signal delivered to the task so far.
    pub fn delivered_signals(&self, task: TaskId) -> Result<Vec<Signal>, Error> {
        Ok(self.lock().delivered(task)?.to_vec())
    }

    /// Returns the number of pins held on a page.
    pub fn pin_count(&self, pfn: Pfn) -> usize {
        self.lock().pin_count(pfn)
    }

    /// Returns the number of allocated physical pages, page tables included.
    pub fn page_count(&self) -> usize {
        self.lock().page_count()
    }

    /// Returns the leaf entry mapping `va`, or `None` if a table above it is
    /// missing.
    pub fn leaf_value(&self, task: TaskId, va: Va) -> Result<Option<PageTableEntry>, Error> {
        self.lock().leaf_value(task, va)
    }

    /// Reads one byte of physical memory.
    pub fn peek(&self, pfn: Pfn, offset: u64) -> Result<u8, Error> {
        self.lock()
            .page(pfn)?
            .get(offset as usize)
            .copied()
            .ok_or(Error::OutOfBounds)
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

impl KernelDriver for SimDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<KernelInfo, KernelError> {
        Ok(self.lock().info())
    }

    fn current_task(&self) -> Result<TaskId, KernelError> {
        Ok(self.lock().current()?)
    }

    fn find_task(&self, pid: Pid) -> Result<Option<TaskId>, KernelError> {
        Ok(self.lock().find_task(pid))
    }

    fn translation_root(&self, task: TaskId) -> Result<Pa, KernelError> {
        Ok(self.lock().root(task)?)
    }

    fn find_region(&self, task: TaskId, va: Va) -> Result<Option<Region>, KernelError> {
        Ok(self.lock().region(task, va)?)
    }

    fn registers(&self, task: TaskId) -> Result<Registers, KernelError> {
        Ok(self.lock().task(task)?.registers)
    }

    fn read_page(&self, pfn: Pfn) -> Result<MappedPage, KernelError> {
        Ok(MappedPage::new(self.lock().page(pfn)?.to_vec()))
    }

    fn write_page(&self, pfn: Pfn, offset: u64, content: &[u8]) -> Result<(), KernelError> {
        Ok(self.lock().write(pfn, offset, content)?)
    }

    unsafe fn write_entry(&self, entry: Pa, value: u64) -> Result<(), KernelError> {
        Ok(self.lock().write_entry(entry, value)?)
    }

    fn allocate_page(&self) -> Result<Pfn, KernelError> {
        Ok(self.lock().allocate()?)
    }

    fn free_page(&self, pfn: Pfn) -> Result<(), KernelError> {
        Ok(self.lock().free(pfn)?)
    }

    fn pin_user_page(&self, task: TaskId, va: Va) -> Result<Pfn, KernelError> {
        Ok(self.lock().pin(task, va)?)
    }

    fn unpin_page(&self, pfn: Pfn) -> Result<(), KernelError> {
        Ok(self.lock().unpin(pfn)?)
    }

    fn call_task_function(&self, function: Va, task: TaskId) -> Result<(), KernelError> {
        Ok(self.lock().call(function, task)?)
    }

    fn pending_signals(&self, task: TaskId) -> Result<SignalSet, KernelError> {
        Ok(self.lock().pending(task)?)
    }

    fn clear_pending_signal(&self, task: TaskId, signal: Signal) -> Result<(), KernelError> {
        Ok(self.lock().clear_pending(task, signal)?)
    }

    fn recalc_sigpending(&self, task: TaskId) -> Result<(), KernelError> {
        Ok(self.lock().recalc_sigpending(task)?)
    }

    fn on_each_cpu(&self, operation: CpuOperation, _wait: bool) -> Result<(), KernelError> {
        self.lock().on_each_cpu(operation);
        Ok(())
    }
}

impl SymbolResolver for SimDriver {
    fn lookup_name(&self, name: &str) -> Option<Va> {
        self.lock().lookup(name)
    }
}

impl FunctionInterceptor<Amd64> for SimDriver {
    fn install(
        &self,
        name: &'static str,
        replacement: SharedHooks<Amd64>,
    ) -> Result<Va, KernelError> {
        Ok(self.lock().intercept(name, replacement)?)
    }

    fn remove(&self, name: &'static str) -> Result<(), KernelError> {
        Ok(self.lock().release(name)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pagewatch_core::{
        AddressContext, Architecture as _, FaultOutcome, KernelCore, KernelHooks, PteFault,
        Registers as _,
    };

    use super::*;

    /// Counts the events routed to it and takes the kernel's own path.
    #[derive(Default)]
    struct Counting {
        faults: AtomicUsize,
        signals: AtomicUsize,
    }

    impl KernelHooks<Amd64> for Counting {
        fn handle_pte_fault(
            &self,
            fault: &PteFault,
            original: &dyn Fn(&PteFault) -> FaultOutcome,
        ) -> FaultOutcome {
            self.faults.fetch_add(1, Ordering::Relaxed);
            original(fault)
        }

        fn arch_do_signal_or_restart(&self, registers: &Registers, original: &dyn Fn(&Registers)) {
            self.signals.fetch_add(1, Ordering::Relaxed);
            original(registers)
        }
    }

    const CODE: Va = Va(0x40_1000);
    const DATA: Va = Va(0x60_2000);

    fn machine() -> (SimDriver, TaskId) {
        let sim = SimDriver::new();
        let task = sim.spawn(Pid(100));
        (sim, task)
    }

    #[test]
    fn access_mapped_page() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.map(task, CODE, &[0x90, 0xc3], MemoryAccess::RX)?;
        sim.map(task, DATA, &[0u8; 16], MemoryAccess::RW)?;

        let outcome = sim.access(task, Access::fetch(CODE + 1))?;
        assert_eq!(outcome.value, Some(0xc3));
        assert_eq!(outcome.faults, 0);

        let outcome = sim.access(task, Access::write(CODE, DATA + 4, 0x41))?;
        assert_eq!(outcome.value, Some(0x41));

        let outcome = sim.access(task, Access::read(CODE, DATA + 4))?;
        assert_eq!(outcome.value, Some(0x41));
        assert!(outcome.signals.is_empty());
        Ok(())
    }

    #[test]
    fn demand_paging() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.add_region(task, DATA, DATA + 0x4000, MemoryAccess::RW)?;
        assert_eq!(sim.leaf_value(task, DATA + 0x2000)?, None);

        let outcome = sim.access(task, Access::read(CODE, DATA + 0x2010))?;
        assert_eq!(outcome.value, Some(0));
        assert_eq!(outcome.faults, 1);

        let leaf = sim.leaf_value(task, DATA + 0x2000)?.ok_or(Error::OutOfBounds)?;
        assert!(leaf.present());
        assert!(leaf.write());
        assert!(leaf.execute_disable());
        Ok(())
    }

    #[test]
    fn access_outside_region_is_segv() -> Result<(), KernelError> {
        let (sim, task) = machine();

        let outcome = sim.access(task, Access::read(CODE, Va(0x1234)))?;
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.faults, 0);
        assert_eq!(outcome.signals, [Signal::Segv]);
        Ok(())
    }

    #[test]
    fn permission_fault_is_segv() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.map(task, DATA, &[0u8; 16], MemoryAccess::R)?;

        let outcome = sim.access(task, Access::write(CODE, DATA, 1))?;
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.signals, [Signal::Segv]);

        let outcome = sim.access(task, Access::fetch(DATA))?;
        assert_eq!(outcome.signals, [Signal::Segv]);
        Ok(())
    }

    #[test]
    fn absent_entry_with_frame_is_sigbus() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.map(task, DATA, &[7u8; 16], MemoryAccess::RW)?;
        sim.set_current(task)?;

        let core = KernelCore::new(sim.clone())?;
        let root = core.translation_root(task)?;
        let entry = Amd64::leaf_entry(&core, AddressContext::new(DATA, root))?
            .ok_or(KernelError::UnresolvedTranslation(DATA))?;
        core.clear_leaf_present(entry)?;

        let outcome = sim.access(task, Access::read(CODE, DATA))?;
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.faults, 1);
        assert_eq!(outcome.signals, [Signal::Bus]);
        Ok(())
    }

    #[test]
    fn stale_tlb_until_flush() -> Result<(), KernelError> {
        let (sim, task) = machine();
        let frame = sim.map(task, DATA, &[1u8; 16], MemoryAccess::RW)?;

        // Fill the TLB.
        sim.access(task, Access::read(CODE, DATA))?;

        let core = KernelCore::new(sim.clone())?;
        let other = core.allocate_page()?;
        core.write_page(other, 0, &[2u8; 16])?;

        let root = core.translation_root(task)?;
        let entry = Amd64::leaf_entry(&core, AddressContext::new(DATA, root))?
            .ok_or(KernelError::UnresolvedTranslation(DATA))?;

        // SAFETY: The entry was resolved above and keeps its flags.
        unsafe {
            sim.write_entry(
                entry.address(),
                PageTableEntry::new(other, MemoryAccess::RW).0,
            )?
        };

        let outcome = sim.access(task, Access::read(CODE, DATA))?;
        assert_eq!(outcome.value, Some(1), "translation is still cached");

        sim.on_each_cpu(CpuOperation::FlushTlbAll, true)?;

        let outcome = sim.access(task, Access::read(CODE, DATA))?;
        assert_eq!(outcome.value, Some(2));
        assert_eq!(sim.peek(frame, 0)?, 1);
        Ok(())
    }

    #[test]
    fn single_step_raises_trap() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.map(task, CODE, &[0x90], MemoryAccess::RX)?;

        let enable = sim
            .lookup_name("user_enable_single_step")
            .ok_or(KernelError::SymbolNotFound("user_enable_single_step"))?;
        sim.call_task_function(enable, task)?;
        assert!(sim.registers(task)?.single_step());

        let outcome = sim.access(task, Access::fetch(CODE))?;
        assert_eq!(outcome.signals, [Signal::Trap]);
        assert_eq!(sim.counters().traps, 1);
        assert!(sim.pending_signals(task)?.is_empty());
        Ok(())
    }

    #[test]
    fn interception() -> Result<(), KernelError> {
        let (sim, _) = machine();
        sim.refuse_hook("arch_do_signal_or_restart");

        let hooks = Arc::new(Counting::default());

        let original = sim.install("handle_pte_fault", hooks.clone())?;
        assert_eq!(sim.lookup_name("handle_pte_fault"), Some(original));
        assert!(sim.is_intercepted("handle_pte_fault"));

        assert!(sim.install("handle_pte_fault", hooks.clone()).is_err());
        assert!(sim.install("arch_do_signal_or_restart", hooks).is_err());

        sim.remove("handle_pte_fault")?;
        assert!(!sim.is_intercepted("handle_pte_fault"));
        assert!(sim.remove("handle_pte_fault").is_err());
        Ok(())
    }

    #[test]
    fn intercepted_events_reach_replacement() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.map(task, CODE, &[0x90], MemoryAccess::RX)?;
        sim.add_region(task, DATA, DATA + 0x1000, MemoryAccess::RW)?;

        let hooks = Arc::new(Counting::default());
        sim.install("handle_pte_fault", hooks.clone())?;
        sim.install("arch_do_signal_or_restart", hooks.clone())?;

        // Demand paging goes through the replacement, which delegates.
        let outcome = sim.access(task, Access::read(CODE, DATA))?;
        assert_eq!(outcome.value, Some(0));
        assert_eq!(hooks.faults.load(Ordering::Relaxed), 1);

        // A pending signal is delivered through the replacement.
        let outcome = sim.access(task, Access::write(CODE, CODE, 1))?;
        assert_eq!(outcome.signals, [Signal::Segv]);
        assert_eq!(hooks.faults.load(Ordering::Relaxed), 2);
        assert_eq!(hooks.signals.load(Ordering::Relaxed), 1);

        sim.remove("handle_pte_fault")?;
        sim.remove("arch_do_signal_or_restart")?;

        sim.access(task, Access::write(CODE, CODE, 1))?;
        assert_eq!(hooks.faults.load(Ordering::Relaxed), 2);
        assert_eq!(hooks.signals.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn failing_entry_writes() -> Result<(), KernelError> {
        let (sim, task) = machine();
        sim.map(task, DATA, &[1u8; 16], MemoryAccess::RW)?;

        let core = KernelCore::new(sim.clone())?;
        let root = core.translation_root(task)?;
        let entry = Amd64::leaf_entry(&core, AddressContext::new(DATA, root))?
            .ok_or(KernelError::UnresolvedTranslation(DATA))?;

        sim.fail_entry_writes(true);
        assert!(core.clear_leaf_present(entry).is_err());
        assert!(core.read_leaf(entry).map(Amd64::entry_present)?);

        sim.fail_entry_writes(false);
        core.clear_leaf_present(entry)?;
        assert!(!core.read_leaf(entry).map(Amd64::entry_present)?);
        Ok(())
    }

    #[test]
    fn pinned_page_cannot_be_freed() -> Result<(), KernelError> {
        let (sim, task) = machine();
        let frame = sim.map(task, DATA, &[], MemoryAccess::RW)?;

        assert_eq!(sim.pin_user_page(task, DATA)?, frame);
        assert_eq!(sim.pin_count(frame), 1);
        assert!(sim.free_page(frame).is_err());

        sim.unpin_page(frame)?;
        assert_eq!(sim.pin_count(frame), 0);
        assert!(sim.unpin_page(frame).is_err());
        sim.free_page(frame)?;
        Ok(())
    }

    #[test]
    fn allocation_limit() -> Result<(), KernelError> {
        let (sim, _) = machine();
        sim.set_allocation_limit(Some(1));

        sim.allocate_page()?;
        assert!(sim.allocate_page().is_err());

        sim.set_allocation_limit(None);
        sim.allocate_page()?;
        Ok(())
    }
}
