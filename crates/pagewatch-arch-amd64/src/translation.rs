use pagewatch_core::Pa;
use smallvec::SmallVec;

use super::{PageTableEntry, PageTableLevel};

/// A single entry in the page table hierarchy during virtual address
/// translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The level of the page table hierarchy this entry belongs to.
    pub level: PageTableLevel,

    /// The actual page table entry.
    pub entry: PageTableEntry,

    /// The physical address where this entry is located in memory.
    pub entry_address: Pa,
}

impl TranslationEntry {
    /// Checks if the entry maps a page rather than another table.
    pub fn is_leaf(&self) -> bool {
        self.entry.present()
            && match self.level {
                PageTableLevel::Pt => true,
                PageTableLevel::Pd | PageTableLevel::Pdpt => self.entry.large(),
                PageTableLevel::Pml4 | PageTableLevel::Pml5 => false,
            }
    }
}

/// Collection of translation entries, one per traversed level.
pub type TranslationEntries = SmallVec<[TranslationEntry; 5]>;

/// The result of a page table walk.
///
/// The walk records every entry it read, including the one at which it
/// stopped. A walk that stopped early has no physical address.
#[derive(Debug)]
pub struct VaTranslation {
    pub(super) entries: TranslationEntries,
    pub(super) pa: Option<Pa>,
}

impl VaTranslation {
    /// Returns the page table entries traversed during the translation process.
    pub fn entries(&self) -> &[TranslationEntry] {
        &self.entries
    }

    /// Returns the last entry read by the walk.
    pub fn last(&self) -> Option<&TranslationEntry> {
        self.entries.last()
    }

    /// Returns the physical address resulting from the translation, if
    /// successful.
    pub fn pa(&self) -> Option<Pa> {
        self.pa
    }

    /// Checks if all page table entries in the translation path are present.
    pub fn present(&self) -> bool {
        self.entries.iter().all(|entry| entry.entry.present())
    }
}

impl IntoIterator for VaTranslation {
    type Item = TranslationEntry;
    type IntoIter = <TranslationEntries as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
