/// The RFLAGS register.
///
/// Only the flags relevant to stepping a user task are decoded. The value is
/// otherwise carried through unchanged.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct Rflags(pub u64);

impl Rflags {
    /// Bits that are fixed to 1 ("read_as_1" field).
    pub const FIXED_BITS: u64 = 0x00000002;

    const TRAP: u64 = 1 << 8;
    const INTERRUPT_ENABLE: u64 = 1 << 9;
    const RESUME: u64 = 1 << 16;

    /// Checks if the Trap Flag (TF) is set.
    ///
    /// Set to enable single-step mode for debugging; clear to disable
    /// single-step mode. In single-step mode, the processor generates a debug
    /// exception after each instruction.
    pub fn trap(self) -> bool {
        self.0 & Self::TRAP != 0
    }

    /// Returns the register with the Trap Flag set or cleared.
    pub fn with_trap(self, enabled: bool) -> Self {
        match enabled {
            true => Self(self.0 | Self::TRAP),
            false => Self(self.0 & !Self::TRAP),
        }
    }

    /// Checks if the Interrupt Enable Flag (IF) is set.
    pub fn interrupt_enable(self) -> bool {
        self.0 & Self::INTERRUPT_ENABLE != 0
    }

    /// Checks if the Resume Flag (RF) is set.
    ///
    /// Temporarily disables debug exceptions for the next instruction.
    pub fn resume(self) -> bool {
        self.0 & Self::RESUME != 0
    }
}

impl std::fmt::Debug for Rflags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Rflags")
            .field("trap", &self.trap())
            .field("interrupt_enable", &self.interrupt_enable())
            .field("resume", &self.resume())
            .finish()
    }
}

impl From<u64> for Rflags {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Rflags> for u64 {
    fn from(value: Rflags) -> Self {
        value.0
    }
}
