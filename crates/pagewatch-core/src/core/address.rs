use serde::{Deserialize, Serialize};

use super::macros::impl_ops;

impl_ops!(Pfn, u64, "Physical Frame Number");
impl_ops!(Pa, u64, "Physical Address");
impl_ops!(Va, u64, "Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A virtual address together with the root of the page table hierarchy
/// it should be translated through.
///
/// Every process has its own hierarchy, so a bare [`Va`] is ambiguous
/// without the root (e.g., the `pgd` of the owning `mm_struct`, which is
/// what `CR3` points at on AMD64 while the process is running).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressContext {
    /// The virtual address.
    pub va: Va,

    /// The translation root (physical address of the top-level table).
    pub root: Pa,
}

impl AddressContext {
    /// Creates a new `AddressContext` with the given virtual address and
    /// translation root.
    pub fn new(va: impl Into<Va>, root: impl Into<Pa>) -> Self {
        Self {
            va: va.into(),
            root: root.into(),
        }
    }
}

impl From<(Va, Pa)> for AddressContext {
    fn from((va, root): (Va, Pa)) -> Self {
        Self::new(va, root)
    }
}
