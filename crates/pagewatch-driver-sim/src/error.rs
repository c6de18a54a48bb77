use pagewatch_core::{Pa, Pfn, Va};

/// Error type for the simulated kernel.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No task is running on the current CPU.
    #[error("No current task")]
    NoCurrentTask,

    /// The task does not exist.
    #[error("Unknown task")]
    UnknownTask,

    /// The CPU does not exist.
    #[error("Unknown CPU")]
    UnknownCpu,

    /// The page frame is not allocated.
    #[error("Page frame {0} not allocated")]
    PageNotFound(Pfn),

    /// The address has no present mapping.
    #[error("Address {0} is not mapped")]
    NotMapped(Va),

    /// The physical page allocator is exhausted.
    #[error("Out of memory")]
    OutOfMemory,

    /// The page is pinned and cannot be freed.
    #[error("Page frame {0} is pinned")]
    PagePinned(Pfn),

    /// The page is not pinned.
    #[error("Page frame {0} is not pinned")]
    PageNotPinned(Pfn),

    /// No kernel function lives at the address.
    #[error("No function at {0}")]
    UnknownFunction(Va),

    /// The function cannot be intercepted.
    #[error("Interception of `{0}` refused")]
    HookRefused(String),

    /// The function is not intercepted.
    #[error("`{0}` is not intercepted")]
    NotHooked(String),

    /// Writes to page-table entries are failing.
    #[error("Failed to write entry at {0}")]
    EntryWriteFailed(Pa),

    /// An access kept faulting without making progress.
    #[error("Access to {0} keeps faulting")]
    FaultLoop(Va),

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,
}

impl From<Error> for pagewatch_core::KernelError {
    fn from(error: Error) -> Self {
        match error {
            Error::PageNotFound(pfn) => Self::PageNotPresent(pfn),
            Error::OutOfBounds => Self::OutOfBounds,
            error => Self::Driver(Box::new(error)),
        }
    }
}
