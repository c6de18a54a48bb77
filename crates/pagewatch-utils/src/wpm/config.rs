use pagewatch_core::{KernelError, Pid, Va};
use serde::{Deserialize, Serialize};

use super::MAX_MARKED_IPS;

/// A single byte written into the read backing of every watched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPatch {
    /// Offset within the page.
    pub offset: u64,

    /// The byte to write.
    pub value: u8,
}

impl ContentPatch {
    /// Creates a patch of one byte.
    pub fn new(offset: u64, value: u8) -> Self {
        Self { offset, value }
    }

    /// Expands a byte string into consecutive single-byte patches starting
    /// at `offset`.
    pub fn sequence(offset: u64, bytes: &[u8]) -> Vec<Self> {
        bytes
            .iter()
            .zip(offset..)
            .map(|(&value, offset)| Self { offset, value })
            .collect()
    }
}

/// Configuration of the watchpoint module.
///
/// # Examples
///
/// ```
/// # use pagewatch_core::{Pid, Va};
/// # use pagewatch_utils::wpm::{ContentPatch, WatchConfig};
/// let config = WatchConfig::new(Pid(1234))
///     .with_address(Va(0x401000))
///     .with_marked_ip(Va(0x401155))
///     .with_patches(ContentPatch::sequence(0x155, &[0xde, 0xad, 0xbe, 0xef]));
///
/// assert!(config.validate(0x1000).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// The process to track.
    pub pid: Pid,

    /// Addresses of the pages to watch.
    pub addresses: Vec<Va>,

    /// Instruction pointers whose accesses are always serviced with the
    /// read backing.
    #[serde(default)]
    pub marked_ips: Vec<Va>,

    /// Bytes written into the read backing of every watched page.
    #[serde(default)]
    pub patches: Vec<ContentPatch>,
}

impl WatchConfig {
    /// Creates an empty configuration for the given process.
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            addresses: Vec::new(),
            marked_ips: Vec::new(),
            patches: Vec::new(),
        }
    }

    /// Adds an address to watch.
    pub fn with_address(mut self, va: Va) -> Self {
        self.addresses.push(va);
        self
    }

    /// Adds an instruction pointer forced to the read backing.
    pub fn with_marked_ip(mut self, ip: Va) -> Self {
        self.marked_ips.push(ip);
        self
    }

    /// Adds content patches.
    pub fn with_patches(mut self, patches: impl IntoIterator<Item = ContentPatch>) -> Self {
        self.patches.extend(patches);
        self
    }

    /// Checks that the configuration can be applied to pages of
    /// `page_size` bytes.
    pub fn validate(&self, page_size: u64) -> Result<(), KernelError> {
        if self.addresses.is_empty() {
            return Err(KernelError::InvalidConfig("no address to watch"));
        }

        if self.marked_ips.len() > MAX_MARKED_IPS {
            return Err(KernelError::InvalidConfig("too many marked instruction pointers"));
        }

        if self.patches.iter().any(|patch| patch.offset >= page_size) {
            return Err(KernelError::InvalidConfig("patch offset outside of the page"));
        }

        Ok(())
    }
}
