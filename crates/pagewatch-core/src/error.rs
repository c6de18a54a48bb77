use crate::{Pfn, Pid, Va};

/// An error that can occur when working with watched pages.
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    /// An error occurred in the kernel driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// A level of the page table hierarchy was absent or malformed.
    #[error("Unresolved translation for {0}")]
    UnresolvedTranslation(Va),

    /// The address does not fall into any memory region of the process.
    #[error("Address {0} is not mapped in any region")]
    UnmappedRegion(Va),

    /// A physical page could not be obtained.
    #[error("Failed to allocate a backing page for {0}")]
    AllocationFailure(Va),

    /// The function interception collaborator refused a hook.
    #[error("Failed to install hook for `{0}`")]
    HookInstall(&'static str),

    /// A kernel symbol could not be resolved.
    #[error("Symbol `{0}` not found")]
    SymbolNotFound(&'static str),

    /// No task exists for the given process identifier.
    #[error("Task with pid {0} not found")]
    TaskNotFound(Pid),

    /// The page is already watched.
    #[error("Page {0} is already watched")]
    AlreadyWatched(Va),

    /// The watch configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A page frame is not known to the driver.
    #[error("Page frame {0} not present")]
    PageNotPresent(Pfn),

    /// An internal invariant of the watchpoint state machine was violated.
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(&'static str),

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}
