use serde::{Deserialize, Serialize};

use crate::Pfn;

/// Represents information about the kernel the driver is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KernelInfo {
    /// The size of a page in bytes.
    pub page_size: u64,

    /// The shift value to convert a page number to a page address.
    pub page_shift: u64,

    /// The maximum physical frame number.
    pub max_pfn: Pfn,

    /// The number of online CPUs.
    pub cpus: u16,

    /// The number of page table levels in use (4 or 5 on AMD64).
    pub page_table_levels: u8,
}
