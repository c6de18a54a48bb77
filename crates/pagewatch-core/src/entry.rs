use crate::Pa;

/// Identity of a leaf page-table entry.
///
/// Two handles are equal exactly when they name the same entry in page-table
/// memory, regardless of the value currently stored there. A handle can only
/// be produced by a page-table walk, so holding one means the entry was
/// resolved and validated at some point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeafEntry(Pa);

impl LeafEntry {
    /// Creates a handle from the physical address of a leaf entry.
    ///
    /// # Safety
    ///
    /// `address` must be the location of a lowest-level entry found by walking
    /// a live page-table hierarchy. The handle is later used to write raw
    /// values into page-table memory.
    pub unsafe fn from_walk(address: Pa) -> Self {
        Self(address)
    }

    /// Returns the physical address of the entry.
    pub fn address(self) -> Pa {
        self.0
    }
}

impl std::fmt::Display for LeafEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pte@{}", self.0)
    }
}
