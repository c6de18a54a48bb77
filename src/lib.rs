//! Software watchpoints for user-mode pages.
//!
//! A watched page is kept absent in the page tables of the tracked process.
//! Every access faults, is classified as an instruction fetch or a data
//! read, and is let through exactly one instruction against one of two
//! physical backings: the original frame for fetches, or a patched copy for
//! everything else. Single-stepping then re-arms the page.
//!
//! The crates are re-exported here:
//!
//! - [`pagewatch_core`] at the root: address types, the driver traits, and
//!   [`KernelCore`].
//! - [`arch`]: architecture support.
//! - [`driver`]: kernel drivers.
//! - [`utils`]: the watchpoint manager and hook batching.

pub use pagewatch_core::*;

/// Architecture support.
pub mod arch {
    /// AMD64 architecture.
    #[cfg(feature = "arch-amd64")]
    pub mod amd64 {
        pub use pagewatch_arch_amd64::*;
    }
}

/// Kernel drivers.
pub mod driver {
    /// Simulated kernel driver.
    #[cfg(feature = "driver-sim")]
    pub mod sim {
        pub use pagewatch_driver_sim::*;
    }
}

/// Utilities.
#[cfg(feature = "utils")]
pub mod utils {
    pub use pagewatch_utils::*;
}
