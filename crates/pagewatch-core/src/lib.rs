//! Core types and the kernel access layer for software watchpoints.
//!
//! [`KernelCore`] wraps a [`KernelDriver`] and is the only place that writes
//! page-table memory. Every leaf-entry mutation it performs is followed by a
//! synchronous flush on all CPUs before the call returns.

pub mod arch;
mod core;
mod driver;
mod entry;
mod error;
mod fault;
mod hooks;
mod page;

use zerocopy::FromBytes;

pub use self::{
    arch::{Architecture, Registers},
    core::{
        AddressContext, CpuId, KernelInfo, MemoryAccess, Pa, Pfn, Pid, Region, Signal, SignalSet,
        TaskId, Va,
    },
    driver::{CpuOperation, FunctionInterceptor, KernelDriver, SymbolResolver},
    entry::LeafEntry,
    error::KernelError,
    fault::{FaultFlags, FaultOutcome, PteFault},
    hooks::{KernelHooks, SharedHooks},
    page::MappedPage,
};

/// Access to the running kernel through a driver.
pub struct KernelCore<Driver>
where
    Driver: KernelDriver,
{
    driver: Driver,
    info: KernelInfo,
}

impl<Driver> KernelCore<Driver>
where
    Driver: KernelDriver,
{
    /// Creates a new `KernelCore` instance with the given driver.
    pub fn new(driver: Driver) -> Result<Self, KernelError> {
        let info = driver.info()?;
        Ok(Self { driver, info })
    }

    /// Returns the driver used by this `KernelCore` instance.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns information about the kernel, captured at creation.
    pub fn info(&self) -> &KernelInfo {
        &self.info
    }

    /// Returns the task executing on the current CPU.
    pub fn current_task(&self) -> Result<TaskId, KernelError> {
        self.driver.current_task()
    }

    /// Finds the task of a process by its identifier.
    pub fn find_task(&self, pid: Pid) -> Result<TaskId, KernelError> {
        self.driver.find_task(pid)?.ok_or(KernelError::TaskNotFound(pid))
    }

    /// Returns the root of the task's page-table hierarchy.
    pub fn translation_root(&self, task: TaskId) -> Result<Pa, KernelError> {
        self.driver.translation_root(task)
    }

    /// Finds the memory region containing `va` in the task's address space.
    pub fn find_region(&self, task: TaskId, va: Va) -> Result<Option<Region>, KernelError> {
        self.driver.find_region(task, va)
    }

    /// Retrieves the user register frame of a task.
    pub fn registers(
        &self,
        task: TaskId,
    ) -> Result<<Driver::Architecture as Architecture>::Registers, KernelError> {
        self.driver.registers(task)
    }

    /// Reads a page of physical memory.
    pub fn read_page(&self, pfn: Pfn) -> Result<MappedPage, KernelError> {
        self.driver.read_page(pfn)
    }

    /// Writes data to a page of physical memory.
    pub fn write_page(&self, pfn: Pfn, offset: u64, content: &[u8]) -> Result<(), KernelError> {
        if offset + content.len() as u64 > self.info.page_size {
            return Err(KernelError::OutOfBounds);
        }

        self.driver.write_page(pfn, offset, content)
    }

    /// Copies the full content of one physical page into another.
    pub fn copy_page(&self, source: Pfn, destination: Pfn) -> Result<(), KernelError> {
        let content = self.driver.read_page(source)?;
        self.driver.write_page(destination, 0, &content)
    }

    /// Reads a 64-bit value from physical memory.
    pub fn read_u64(&self, pa: Pa) -> Result<u64, KernelError> {
        let page = self.read_page(Driver::Architecture::pfn_from_pa(pa))?;
        let offset = Driver::Architecture::pa_offset(pa) as usize;

        let (value, _) =
            u64::read_from_prefix(&page[offset..]).map_err(|_| KernelError::OutOfBounds)?;

        Ok(value)
    }

    /// Reads the raw value of a leaf entry.
    pub fn read_leaf(&self, entry: LeafEntry) -> Result<u64, KernelError> {
        self.read_u64(entry.address())
    }

    /// Sets the present bit of a leaf entry and flushes every CPU.
    pub fn set_leaf_present(&self, entry: LeafEntry) -> Result<(), KernelError> {
        let value = self.read_leaf(entry)?;
        self.write_leaf(entry, Driver::Architecture::entry_with_present(value, true))
    }

    /// Clears the present bit of a leaf entry and flushes every CPU.
    pub fn clear_leaf_present(&self, entry: LeafEntry) -> Result<(), KernelError> {
        let value = self.read_leaf(entry)?;
        self.write_leaf(entry, Driver::Architecture::entry_with_present(value, false))
    }

    /// Points a leaf entry at `pfn`, marks it present, and flushes every CPU.
    ///
    /// All other bits of the entry are preserved.
    pub fn install_leaf(&self, entry: LeafEntry, pfn: Pfn) -> Result<(), KernelError> {
        let value = self.read_leaf(entry)?;
        let value = Driver::Architecture::entry_with_pfn(value, pfn);
        self.write_leaf(entry, Driver::Architecture::entry_with_present(value, true))
    }

    /// Points every entry at its frame and marks it present, then flushes
    /// every CPU once.
    ///
    /// All entries are attempted even if some writes fail. The first error
    /// is returned after the flush.
    pub fn install_leaves(
        &self,
        entries: impl IntoIterator<Item = (LeafEntry, Pfn)>,
    ) -> Result<(), KernelError> {
        let mut result = Ok(());

        for (entry, pfn) in entries {
            let written = self.read_leaf(entry).and_then(|value| {
                let value = Driver::Architecture::entry_with_pfn(value, pfn);
                self.write_leaf_raw(entry, Driver::Architecture::entry_with_present(value, true))
            });

            if let Err(err) = written {
                tracing::warn!(%entry, %err, "failed to restore leaf entry");
                result = result.and(Err(err));
            }
        }

        self.flush_all()?;
        result
    }

    fn write_leaf(&self, entry: LeafEntry, value: u64) -> Result<(), KernelError> {
        self.write_leaf_raw(entry, value)?;
        self.flush_all()
    }

    fn write_leaf_raw(&self, entry: LeafEntry, value: u64) -> Result<(), KernelError> {
        // SAFETY: `LeafEntry` is only created from a page-table walk, and the
        // value was derived from the entry's own contents.
        unsafe { self.driver.write_entry(entry.address(), value)? };
        tracing::trace!(%entry, value = %format_args!("{value:#x}"), "leaf entry written");
        Ok(())
    }

    /// Invalidates the translation and cache state of every online CPU.
    ///
    /// Returns only after all CPUs have completed the flush.
    pub fn flush_all(&self) -> Result<(), KernelError> {
        self.driver.on_each_cpu(CpuOperation::FlushTlbAll, true)?;
        self.driver.on_each_cpu(CpuOperation::InvalidateCaches, true)
    }

    /// Allocates a zeroed physical page.
    pub fn allocate_page(&self) -> Result<Pfn, KernelError> {
        self.driver.allocate_page()
    }

    /// Frees a page obtained from [`allocate_page`].
    ///
    /// [`allocate_page`]: Self::allocate_page
    pub fn free_page(&self, pfn: Pfn) -> Result<(), KernelError> {
        self.driver.free_page(pfn)
    }

    /// Pins the physical page currently backing `va` in the task's address
    /// space.
    pub fn pin_user_page(&self, task: TaskId, va: Va) -> Result<Pfn, KernelError> {
        self.driver.pin_user_page(task, va)
    }

    /// Drops a pin taken by [`pin_user_page`].
    ///
    /// [`pin_user_page`]: Self::pin_user_page
    pub fn unpin_page(&self, pfn: Pfn) -> Result<(), KernelError> {
        self.driver.unpin_page(pfn)
    }

    /// Invokes a resolved kernel function on a task.
    pub fn call_task_function(&self, function: Va, task: TaskId) -> Result<(), KernelError> {
        self.driver.call_task_function(function, task)
    }

    /// Returns the pending signals of a task.
    pub fn pending_signals(&self, task: TaskId) -> Result<SignalSet, KernelError> {
        self.driver.pending_signals(task)
    }

    /// Removes `signal` from the task's pending set and recomputes its
    /// signal-pending state.
    pub fn suppress_signal(&self, task: TaskId, signal: Signal) -> Result<(), KernelError> {
        self.driver.clear_pending_signal(task, signal)?;
        self.driver.recalc_sigpending(task)
    }
}

impl<Driver> std::fmt::Debug for KernelCore<Driver>
where
    Driver: KernelDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KernelCore")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
