//! AMD64 architecture definitions.

mod paging;
mod registers;
mod rflags;
mod translation;

use pagewatch_core::{
    AddressContext, Architecture, KernelCore, KernelDriver, KernelError, LeafEntry, MemoryAccess,
    Pa, Pfn, Va,
};
use zerocopy::FromBytes;

pub use self::{
    paging::{PageTableEntry, PageTableLevel, PagingMode},
    registers::Registers,
    rflags::Rflags,
    translation::{TranslationEntries, TranslationEntry, VaTranslation},
};

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

impl Architecture for Amd64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    type Registers = Registers;
    type PageTableLevel = PageTableLevel;

    fn pfn_from_pa(pa: Pa) -> Pfn {
        Pfn(pa.0 >> Self::PAGE_SHIFT)
    }

    fn pa_from_pfn(pfn: Pfn) -> Pa {
        Pa(pfn.0 << Self::PAGE_SHIFT)
    }

    fn pa_offset(pa: Pa) -> u64 {
        pa.0 & !Self::PAGE_MASK
    }

    fn va_align_down(va: Va) -> Va {
        va & Self::PAGE_MASK
    }

    fn va_offset(va: Va) -> u64 {
        Self::va_offset_for(va, PageTableLevel::Pt)
    }

    fn va_index_for(va: Va, level: Self::PageTableLevel) -> u64 {
        (va.0 >> level.shift()) & 0x1ff
    }

    fn entry_present(entry: u64) -> bool {
        PageTableEntry(entry).present()
    }

    fn entry_with_present(entry: u64, present: bool) -> u64 {
        PageTableEntry(entry).with_present(present).0
    }

    fn entry_pfn(entry: u64) -> Pfn {
        PageTableEntry(entry).pfn()
    }

    fn entry_with_pfn(entry: u64, pfn: Pfn) -> u64 {
        PageTableEntry(entry).with_pfn(pfn).0
    }

    fn entry_from_pfn(pfn: Pfn, access: MemoryAccess) -> u64 {
        PageTableEntry::new(pfn, access).0
    }

    fn leaf_entry<Driver>(
        core: &KernelCore<Driver>,
        ctx: AddressContext,
    ) -> Result<Option<LeafEntry>, KernelError>
    where
        Driver: KernelDriver<Architecture = Self>,
    {
        let translation = Self::translation(core, ctx);

        // The walk stops at the first absent, bad, or large entry. Only a
        // walk that reached the PT level yields a leaf, whether or not the
        // leaf itself is present.
        let leaf = match translation.last() {
            Some(entry) if entry.level == PageTableLevel::Pt => entry,
            _ => return Ok(None),
        };

        // SAFETY: The address was produced by walking the hierarchy above.
        Ok(Some(unsafe { LeafEntry::from_walk(leaf.entry_address) }))
    }

    fn leaf_entry_from_pmd<Driver>(
        core: &KernelCore<Driver>,
        pmd: Pa,
        va: Va,
    ) -> Result<Option<LeafEntry>, KernelError>
    where
        Driver: KernelDriver<Architecture = Self>,
    {
        let pde = PageTableEntry(core.read_u64(pmd)?);

        if !pde.present() || pde.large() || pde.bad(PageTableLevel::Pd, core.info().max_pfn) {
            return Ok(None);
        }

        let entry_address = Self::pa_from_pfn(pde.pfn())
            + Self::va_index_for(va, PageTableLevel::Pt) * size_of::<PageTableEntry>() as u64;

        // SAFETY: The address is an entry of the page table referenced by a
        // present, well-formed page directory entry.
        Ok(Some(unsafe { LeafEntry::from_walk(entry_address) }))
    }
}

impl Amd64 {
    /// Extracts the offset within a page mapped at the given level.
    pub fn va_offset_for(va: Va, level: PageTableLevel) -> u64 {
        va.0 & ((1 << level.shift()) - 1)
    }

    /// Performs a page table walk and records every traversed entry.
    ///
    /// The walk starts at PML5 when the kernel runs with 5-level paging and at
    /// PML4 otherwise. At each level it:
    ///
    /// - reads the table and records the entry for `ctx.va`,
    /// - stops if the entry is absent or malformed (see
    ///   [`PageTableEntry::bad`]),
    /// - stops with a physical address if the entry maps a large page,
    /// - otherwise continues with the next level.
    ///
    /// A table that cannot be read also ends the walk. The entries collected
    /// so far are returned and the physical address is `None`.
    pub fn translation<Driver>(core: &KernelCore<Driver>, ctx: AddressContext) -> VaTranslation
    where
        Driver: KernelDriver<Architecture = Self>,
    {
        let info = core.info();
        let mut entries = TranslationEntries::new();
        let mut level = PagingMode::from_levels(info.page_table_levels).top_level();
        let mut table = Self::pfn_from_pa(ctx.root);

        loop {
            let buffer = match core.read_page(table) {
                Ok(buffer) => buffer,
                Err(_) => return VaTranslation { entries, pa: None },
            };

            let index = Self::va_index_for(ctx.va, level) as usize;
            let entry = match <[PageTableEntry]>::ref_from_bytes(&buffer)
                .ok()
                .and_then(|page_table| page_table.get(index))
            {
                Some(entry) => *entry,
                None => return VaTranslation { entries, pa: None },
            };

            entries.push(TranslationEntry {
                level,
                entry,
                entry_address: Self::pa_from_pfn(table)
                    + (index * size_of::<PageTableEntry>()) as u64,
            });

            if !entry.present() || entry.bad(level, info.max_pfn) {
                return VaTranslation { entries, pa: None };
            }

            let next = match level.next() {
                Some(next) if !entry.large() => next,
                _ => {
                    return VaTranslation {
                        entries,
                        pa: Some(
                            Self::pa_from_pfn(entry.pfn()) + Self::va_offset_for(ctx.va, level),
                        ),
                    };
                }
            };

            table = entry.pfn();
            level = next;
        }
    }

    /// Translates a virtual address to a physical address.
    pub fn translate_address<Driver>(
        core: &KernelCore<Driver>,
        ctx: AddressContext,
    ) -> Result<Pa, KernelError>
    where
        Driver: KernelDriver<Architecture = Self>,
    {
        Self::translation(core, ctx)
            .pa()
            .ok_or(KernelError::UnresolvedTranslation(ctx.va))
    }
}
