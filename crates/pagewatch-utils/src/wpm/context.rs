use pagewatch_core::{LeafEntry, Pfn, Region, Va};
use smallvec::SmallVec;

use super::MAX_MARKED_IPS;

/// Instruction pointers whose accesses are serviced with the read backing.
pub type MarkedIps = SmallVec<[Va; MAX_MARKED_IPS]>;

/// The kind of access that caused a fault on a watched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// The faulting instruction pointer is marked. Serviced with the read
    /// backing even when the access is an instruction fetch.
    ForcedRead,

    /// The fault address equals the instruction pointer. Serviced with the
    /// exec backing.
    InstructionFetch,

    /// Any other access. Serviced with the read backing.
    DataRead,
}

impl AccessKind {
    /// Classifies an access.
    ///
    /// The first matching rule wins:
    ///
    /// 1. `ip` is one of `marked_ips`: [`ForcedRead`].
    /// 2. `real_address` equals `ip`: [`InstructionFetch`].
    /// 3. Otherwise: [`DataRead`].
    ///
    /// [`ForcedRead`]: Self::ForcedRead
    /// [`InstructionFetch`]: Self::InstructionFetch
    /// [`DataRead`]: Self::DataRead
    pub fn classify(marked_ips: &[Va], ip: Va, real_address: Va) -> Self {
        if marked_ips.contains(&ip) {
            Self::ForcedRead
        } else if real_address == ip {
            Self::InstructionFetch
        } else {
            Self::DataRead
        }
    }
}

/// The state of a watched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// The leaf entry is absent. The next access of any kind faults.
    Armed,

    /// A backing is installed and present, and one instruction is being
    /// single-stepped against it.
    Servicing,

    /// The leaf entry is present with its original mapping. This is the
    /// state right after registration and after teardown.
    Released,
}

/// Number of classifications per access kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccessCounters {
    /// Accesses classified as [`AccessKind::ForcedRead`].
    pub forced_read: u64,

    /// Accesses classified as [`AccessKind::InstructionFetch`].
    pub instruction_fetch: u64,

    /// Accesses classified as [`AccessKind::DataRead`].
    pub data_read: u64,
}

impl AccessCounters {
    pub(super) fn record(&mut self, kind: AccessKind) {
        match kind {
            AccessKind::ForcedRead => self.forced_read += 1,
            AccessKind::InstructionFetch => self.instruction_fetch += 1,
            AccessKind::DataRead => self.data_read += 1,
        }
    }

    /// Returns the total number of classified accesses.
    pub fn total(&self) -> u64 {
        self.forced_read + self.instruction_fetch + self.data_read
    }
}

/// A watched page.
///
/// The shape of a context never changes after registration. Only the state
/// of its leaf entry (present bit and installed backing) does.
#[derive(Debug, Clone)]
pub struct WatchContext {
    pub(super) va: Va,
    pub(super) entry: LeafEntry,
    pub(super) region: Region,
    pub(super) exec: Pfn,
    pub(super) read: Pfn,
    pub(super) marked_ips: MarkedIps,
    pub(super) state: WatchState,
    pub(super) counters: AccessCounters,
}

impl WatchContext {
    /// Returns the page-aligned virtual address of the watched page.
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns the leaf entry mapping the page.
    pub fn entry(&self) -> LeafEntry {
        self.entry
    }

    /// Returns the memory region the page belongs to, as captured at
    /// registration.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Returns the frame holding the original content of the page.
    pub fn exec_backing(&self) -> Pfn {
        self.exec
    }

    /// Returns the frame holding the copy presented to data accesses.
    pub fn read_backing(&self) -> Pfn {
        self.read
    }

    /// Returns the marked instruction pointers.
    pub fn marked_ips(&self) -> &[Va] {
        &self.marked_ips
    }

    /// Returns the current state of the page.
    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Returns the classification counters of the page.
    pub fn counters(&self) -> AccessCounters {
        self.counters
    }

    /// Selects the backing frame for an access kind.
    pub fn select_backing(&self, kind: AccessKind) -> Pfn {
        match kind {
            AccessKind::InstructionFetch => self.exec,
            AccessKind::ForcedRead | AccessKind::DataRead => self.read,
        }
    }
}
