use bitflags::bitflags;

use crate::{Pa, Va};

bitflags! {
    /// Flags describing a page fault (`FAULT_FLAG_*`).
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// The access was a write.
        const WRITE = 1 << 0;
        /// The fault was taken from user mode.
        const USER = 1 << 6;
        /// The fault was taken on behalf of another address space.
        const REMOTE = 1 << 7;
        /// The fault was caused by an instruction fetch.
        const INSTRUCTION = 1 << 8;
    }
}

bitflags! {
    /// Result of servicing a page fault (`VM_FAULT_*`).
    ///
    /// The empty set means the fault was handled and the instruction should
    /// be retried.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FaultOutcome: u32 {
        /// Out of memory.
        const OOM = 0x0001;
        /// Deliver `SIGBUS`.
        const SIGBUS = 0x0002;
        /// Deliver `SIGSEGV`.
        const SIGSEGV = 0x0040;
    }
}

impl FaultOutcome {
    /// The fault was serviced.
    pub const HANDLED: Self = Self::empty();

    /// Checks if the fault was serviced without error.
    pub fn is_handled(self) -> bool {
        self.is_empty()
    }
}

/// A page fault presented to the leaf-entry fault handler (`handle_pte_fault`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteFault {
    /// The faulting address, aligned down to its page.
    pub address: Va,

    /// The exact address the instruction accessed.
    pub real_address: Va,

    /// The physical address of the page-middle-directory entry covering
    /// the faulting address.
    pub pmd: Pa,

    /// Fault flags.
    pub flags: FaultFlags,
}

impl PteFault {
    /// Checks if the fault was taken on behalf of another address space.
    pub fn is_remote(&self) -> bool {
        self.flags.contains(FaultFlags::REMOTE)
    }
}
