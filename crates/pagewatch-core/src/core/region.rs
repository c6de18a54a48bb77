use super::{MemoryAccess, Va};

/// A memory region (VMA) of a process address space.
///
/// This is a snapshot of the bounds and protection of the kernel's region
/// object taken when the region was looked up. The kernel object itself is
/// owned by the address space, not by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// The first address of the region.
    pub start: Va,

    /// The address one past the end of the region.
    pub end: Va,

    /// The protection flags of the region.
    pub protection: MemoryAccess,
}

impl Region {
    /// Checks if the region contains the given address.
    pub fn contains(&self, va: Va) -> bool {
        self.start <= va && va < self.end
    }
}
