use pagewatch_core::{MemoryAccess, Pfn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Supported long-mode paging modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// 4-level paging (48-bit linear addresses).
    Ia32e,

    /// 5-level paging (57-bit linear addresses).
    Ia32eLA57,
}

impl PagingMode {
    /// Determines the paging mode from the number of page table levels.
    pub fn from_levels(levels: u8) -> Self {
        match levels {
            5 => Self::Ia32eLA57,
            _ => Self::Ia32e,
        }
    }

    /// Returns the top level of the page table hierarchy.
    pub fn top_level(self) -> PageTableLevel {
        match self {
            Self::Ia32e => PageTableLevel::Pml4,
            Self::Ia32eLA57 => PageTableLevel::Pml5,
        }
    }
}

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table (PT) - the lowest level, pointing directly to 4KB pages.
    Pt,

    /// Page Directory (PD) - can point to PTs or 2MB large pages.
    Pd,

    /// Page Directory Pointer Table (PDPT) - can point to PDs or 1GB large
    /// pages.
    Pdpt,

    /// Page Map Level 4 (PML4).
    Pml4,

    /// Page Map Level 5 (PML5) - the highest level in 5-level paging.
    Pml5,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pml5 => Some(Self::Pml4),
        }
    }

    /// Returns the number of address bits translated below this level.
    pub fn shift(self) -> u64 {
        match self {
            Self::Pt => 12,
            Self::Pd => 21,
            Self::Pdpt => 30,
            Self::Pml4 => 39,
            Self::Pml5 => 48,
        }
    }
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    const PRESENT: u64 = 1 << 0;
    const WRITE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const LARGE: u64 = 1 << 7;
    const EXECUTE_DISABLE: u64 = 1 << 63;

    const PFN_SHIFT: u64 = 12;
    const PFN_MASK: u64 = (1 << 40) - 1;

    /// Creates a present user entry mapping `pfn` with the given access.
    pub fn new(pfn: Pfn, access: MemoryAccess) -> Self {
        let mut value = Self::PRESENT | Self::USER;

        if access.contains(MemoryAccess::W) {
            value |= Self::WRITE;
        }

        if !access.contains(MemoryAccess::X) {
            value |= Self::EXECUTE_DISABLE;
        }

        Self(value).with_pfn(pfn)
    }

    /// Checks if the page is present in physical memory.
    pub fn present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    /// Checks if the page is writable.
    pub fn write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        self.0 & Self::USER != 0
    }

    /// Checks if the page has been accessed.
    pub fn accessed(self) -> bool {
        (self.0 >> 5) & 1 != 0
    }

    /// Checks if the page has been written to.
    pub fn dirty(self) -> bool {
        (self.0 >> 6) & 1 != 0
    }

    /// Checks if this entry refers to a large page.
    pub fn large(self) -> bool {
        self.0 & Self::LARGE != 0
    }

    /// Checks if instruction fetches from the page are disallowed.
    pub fn execute_disable(self) -> bool {
        self.0 & Self::EXECUTE_DISABLE != 0
    }

    /// Extracts the page frame number from the entry.
    pub fn pfn(self) -> Pfn {
        Pfn::new((self.0 >> Self::PFN_SHIFT) & Self::PFN_MASK)
    }

    /// Returns the entry with the present bit set or cleared.
    pub fn with_present(self, present: bool) -> Self {
        match present {
            true => Self(self.0 | Self::PRESENT),
            false => Self(self.0 & !Self::PRESENT),
        }
    }

    /// Returns the entry pointing to a different frame.
    pub fn with_pfn(self, pfn: Pfn) -> Self {
        let mask = Self::PFN_MASK << Self::PFN_SHIFT;
        Self((self.0 & !mask) | ((pfn.0 & Self::PFN_MASK) << Self::PFN_SHIFT))
    }

    /// Checks if a present non-leaf entry is malformed (`pXd_bad`).
    ///
    /// The large-page bit is reserved at PML5 and PML4, and a frame number
    /// above `max_pfn` cannot refer to a page table.
    pub fn bad(self, level: PageTableLevel, max_pfn: Pfn) -> bool {
        let reserved_large = matches!(level, PageTableLevel::Pml5 | PageTableLevel::Pml4);

        (reserved_large && self.large()) || self.pfn() > max_pfn
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.write())
            .field("user", &self.user())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("execute_disable", &self.execute_disable())
            .field("pfn", &self.pfn())
            .finish()
    }
}
