//! Architecture abstraction.
//!
//! An [`Architecture`] describes the page size, the layout of page-table
//! entries, and how a virtual address is walked down to its leaf entry.
//! The watchpoint machinery is written against this trait and never touches
//! raw entry bits itself.

use std::fmt::Debug;

use crate::{
    AddressContext, KernelCore, KernelDriver, KernelError, LeafEntry, MemoryAccess, Pa, Pfn, Va,
};

/// Defines an interface for CPU architecture-specific operations and constants.
pub trait Architecture {
    /// The size of a memory page in bytes for the given architecture.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0x1000` (4096 bytes)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page frame numbers
    /// and physical addresses.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `12` (2^12 = 4096)
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0xFFFFFFFFFFFFF000`
    const PAGE_MASK: u64;

    /// The register frame of a user task.
    type Registers: Registers;

    /// An enumeration representing the levels of page tables in the
    /// architecture's paging structure.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: PML5, PML4, PDPT, PD, PT
    type PageTableLevel: Debug + Clone + Copy;

    /// Converts a physical address to a page frame number.
    fn pfn_from_pa(pa: Pa) -> Pfn;

    /// Converts a page frame number to a physical address.
    fn pa_from_pfn(pfn: Pfn) -> Pa;

    /// Extracts the offset within a page from a physical address.
    fn pa_offset(pa: Pa) -> u64;

    /// Aligns a virtual address down to the start of its page.
    fn va_align_down(va: Va) -> Va;

    /// Extracts the offset within a page from a virtual address.
    fn va_offset(va: Va) -> u64;

    /// Calculates the index into the specified level of the page table
    /// hierarchy for a given virtual address.
    fn va_index_for(va: Va, level: Self::PageTableLevel) -> u64;

    /// Checks if a raw leaf entry value has the present bit set.
    fn entry_present(entry: u64) -> bool;

    /// Returns the raw leaf entry value with the present bit set or cleared.
    fn entry_with_present(entry: u64, present: bool) -> u64;

    /// Extracts the page frame number from a raw leaf entry value.
    fn entry_pfn(entry: u64) -> Pfn;

    /// Returns the raw leaf entry value pointing to a different frame.
    ///
    /// All other bits are preserved.
    fn entry_with_pfn(entry: u64, pfn: Pfn) -> u64;

    /// Builds a present user leaf entry for a frame with the given access.
    fn entry_from_pfn(pfn: Pfn, access: MemoryAccess) -> u64;

    /// Walks the page tables of `ctx.root` and returns the leaf entry that
    /// maps `ctx.va`.
    ///
    /// Returns `None` if any level of the hierarchy is absent or malformed.
    fn leaf_entry<Driver>(
        core: &KernelCore<Driver>,
        ctx: AddressContext,
    ) -> Result<Option<LeafEntry>, KernelError>
    where
        Driver: KernelDriver<Architecture = Self>;

    /// Resolves the leaf entry for `va` starting from the page-middle-directory
    /// entry located at `pmd`.
    ///
    /// This is the lookup the fault path performs. It does not re-walk the
    /// upper levels of the hierarchy.
    fn leaf_entry_from_pmd<Driver>(
        core: &KernelCore<Driver>,
        pmd: Pa,
        va: Va,
    ) -> Result<Option<LeafEntry>, KernelError>
    where
        Driver: KernelDriver<Architecture = Self>;
}

/// The register frame of a user task.
pub trait Registers
where
    Self: Debug + Default + Clone + Copy,
{
    /// The specific CPU architecture implementation.
    type Architecture: Architecture;

    /// Returns the current value of the instruction pointer.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `RIP`
    fn instruction_pointer(&self) -> u64;

    /// Checks if single-instruction stepping is armed.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `RFLAGS.TF`
    fn single_step(&self) -> bool;

    /// Arms or disarms single-instruction stepping.
    fn set_single_step(&mut self, enabled: bool);
}
