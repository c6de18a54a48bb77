use crate::{
    Architecture, KernelError, KernelInfo, MappedPage, Pa, Pfn, Pid, Region, SharedHooks, Signal,
    SignalSet, TaskId, Va,
};

/// An operation broadcast to every online CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOperation {
    /// Flush the whole translation lookaside buffer (`flush_tlb_all`).
    FlushTlbAll,

    /// Write back and invalidate the instruction and data caches (`invd`).
    InvalidateCaches,
}

/// A trait for implementing a kernel driver.
///
/// The driver is the boundary between the watchpoint machinery and the host
/// kernel. Everything the machinery knows about tasks, memory, and signals
/// comes through this trait.
pub trait KernelDriver {
    /// The architecture supported by the driver.
    type Architecture: Architecture;

    /// Retrieves information about the running kernel.
    fn info(&self) -> Result<KernelInfo, KernelError>;

    /// Returns the task executing on the current CPU.
    fn current_task(&self) -> Result<TaskId, KernelError>;

    /// Finds the task of a process by its identifier.
    fn find_task(&self, pid: Pid) -> Result<Option<TaskId>, KernelError>;

    /// Returns the physical address of the top-level page table of the task's
    /// address space.
    fn translation_root(&self, task: TaskId) -> Result<Pa, KernelError>;

    /// Finds the memory region containing `va` in the task's address space.
    fn find_region(&self, task: TaskId, va: Va) -> Result<Option<Region>, KernelError>;

    /// Retrieves the user register frame of a task.
    fn registers(
        &self,
        task: TaskId,
    ) -> Result<<Self::Architecture as Architecture>::Registers, KernelError>;

    /// Reads a page of physical memory.
    fn read_page(&self, pfn: Pfn) -> Result<MappedPage, KernelError>;

    /// Writes data to a page of physical memory.
    fn write_page(&self, pfn: Pfn, offset: u64, content: &[u8]) -> Result<(), KernelError>;

    /// Writes a raw value into a page-table entry.
    ///
    /// # Safety
    ///
    /// `entry` must be the address of a leaf entry obtained from a page-table
    /// walk, and `value` must be a valid entry for the architecture. A stale
    /// translation may survive the write until the caller broadcasts a flush.
    unsafe fn write_entry(&self, entry: Pa, value: u64) -> Result<(), KernelError>;

    /// Allocates a zeroed physical page.
    fn allocate_page(&self) -> Result<Pfn, KernelError>;

    /// Frees a page obtained from [`allocate_page`].
    ///
    /// [`allocate_page`]: Self::allocate_page
    fn free_page(&self, pfn: Pfn) -> Result<(), KernelError>;

    /// Pins the physical page currently backing `va` in the task's address
    /// space and returns its frame number.
    fn pin_user_page(&self, task: TaskId, va: Va) -> Result<Pfn, KernelError>;

    /// Drops a pin taken by [`pin_user_page`].
    ///
    /// [`pin_user_page`]: Self::pin_user_page
    fn unpin_page(&self, pfn: Pfn) -> Result<(), KernelError>;

    /// Invokes a resolved kernel function taking a single task argument.
    fn call_task_function(&self, function: Va, task: TaskId) -> Result<(), KernelError>;

    /// Returns the pending signals of a task.
    fn pending_signals(&self, task: TaskId) -> Result<SignalSet, KernelError>;

    /// Removes a signal from the pending set of a task (`sigdelset`).
    fn clear_pending_signal(&self, task: TaskId, signal: Signal) -> Result<(), KernelError>;

    /// Recomputes the signal-pending state of a task (`recalc_sigpending`).
    fn recalc_sigpending(&self, task: TaskId) -> Result<(), KernelError>;

    /// Runs an operation on every online CPU.
    ///
    /// When `wait` is set, returns only after every CPU has completed it.
    fn on_each_cpu(&self, operation: CpuOperation, wait: bool) -> Result<(), KernelError>;
}

/// Resolves kernel symbols to addresses (`kallsyms_lookup_name`).
pub trait SymbolResolver {
    /// Returns the address of the named symbol.
    fn lookup_name(&self, name: &str) -> Option<Va>;
}

/// Redirects named kernel functions to replacement handlers.
///
/// Once a function is redirected, every call to it is routed to the
/// matching entry point of `replacement`, which receives the original
/// implementation to delegate to.
pub trait FunctionInterceptor<Arch>
where
    Arch: Architecture,
{
    /// Redirects the named function to `replacement` and returns the address
    /// of the original implementation.
    fn install(
        &self,
        name: &'static str,
        replacement: SharedHooks<Arch>,
    ) -> Result<Va, KernelError>;

    /// Removes a redirection installed by [`install`].
    ///
    /// [`install`]: Self::install
    fn remove(&self, name: &'static str) -> Result<(), KernelError>;
}
