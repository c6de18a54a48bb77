/// A POSIX signal number relevant to fault and trap handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Signal {
    /// `SIGTRAP`, raised after a single-stepped instruction retires.
    Trap = 5,

    /// `SIGBUS`.
    Bus = 7,

    /// `SIGSEGV`.
    Segv = 11,
}

impl Signal {
    /// Returns the signal number.
    pub fn number(self) -> u8 {
        self as u8
    }

    fn from_number(number: u8) -> Option<Self> {
        match number {
            5 => Some(Self::Trap),
            7 => Some(Self::Bus),
            11 => Some(Self::Segv),
            _ => None,
        }
    }

    fn mask(self) -> u64 {
        1 << (self.number() - 1)
    }
}

/// A set of pending signals (`sigset_t`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalSet(pub u64);

impl SignalSet {
    /// Creates an empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Checks if no signal is pending.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Checks if the signal is in the set.
    pub fn contains(self, signal: Signal) -> bool {
        self.0 & signal.mask() != 0
    }

    /// Adds the signal to the set (`sigaddset`).
    pub fn insert(&mut self, signal: Signal) {
        self.0 |= signal.mask();
    }

    /// Removes the signal from the set (`sigdelset`).
    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !signal.mask();
    }

    /// Iterates over the known signals in the set, lowest number first.
    pub fn iter(self) -> impl Iterator<Item = Signal> {
        (1..=64u8)
            .filter(move |number| self.0 & (1 << (number - 1)) != 0)
            .filter_map(Signal::from_number)
    }
}
