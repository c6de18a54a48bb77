use pagewatch_arch_amd64::{Amd64, PageTableEntry, Registers};
use pagewatch_core::{
    Architecture as _, FaultFlags, FaultOutcome, Pa, PteFault, Registers as _, Signal, TaskId, Va,
};

use crate::{
    Error, SimDriver,
    machine::{ARCH_DO_SIGNAL_OR_RESTART, HANDLE_PTE_FAULT, Translation},
};

/// Maximum number of faults a single access may take before it is
/// considered stuck.
const MAX_FAULTS: usize = 8;

/// The kind of a user-mode memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// An instruction fetch.
    Fetch,

    /// A data read.
    Read,

    /// A data write of one byte.
    Write(u8),
}

impl AccessType {
    pub(crate) fn permitted(self, entry: PageTableEntry) -> bool {
        entry.user()
            && match self {
                Self::Fetch => !entry.execute_disable(),
                Self::Read => true,
                Self::Write(_) => entry.write(),
            }
    }

    pub(crate) fn fault_flags(self) -> FaultFlags {
        match self {
            Self::Fetch => FaultFlags::USER | FaultFlags::INSTRUCTION,
            Self::Read => FaultFlags::USER,
            Self::Write(_) => FaultFlags::USER | FaultFlags::WRITE,
        }
    }
}

/// One memory access performed by a user-mode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    /// The instruction pointer of the accessing instruction.
    pub ip: Va,

    /// The accessed address.
    pub address: Va,

    /// The kind of access.
    pub kind: AccessType,
}

impl Access {
    /// Fetches the instruction at `ip`.
    pub fn fetch(ip: Va) -> Self {
        Self {
            ip,
            address: ip,
            kind: AccessType::Fetch,
        }
    }

    /// Reads one byte at `address` from the instruction at `ip`.
    pub fn read(ip: Va, address: Va) -> Self {
        Self {
            ip,
            address,
            kind: AccessType::Read,
        }
    }

    /// Writes one byte at `address` from the instruction at `ip`.
    pub fn write(ip: Va, address: Va, value: u8) -> Self {
        Self {
            ip,
            address,
            kind: AccessType::Write(value),
        }
    }
}

/// What happened while executing one access.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccessOutcome {
    /// The byte read or written, or `None` if the access did not complete.
    pub value: Option<u8>,

    /// The number of page faults taken.
    pub faults: usize,

    /// Signals delivered to user mode on the way back from the access.
    pub signals: Vec<Signal>,
}

impl SimDriver {
    /// Executes one memory access of `task` on its CPU.
    ///
    /// The access goes through the CPU's TLB and, on a miss, the task's page
    /// tables. A missing or forbidding entry raises a page fault, handled by
    /// the replacement installed for `handle_pte_fault` if there is one and
    /// by the kernel otherwise. The access is retried until it completes or
    /// a fault is turned into a signal.
    ///
    /// On the way back to user mode, a set trap flag raises `SIGTRAP`, and
    /// pending signals are delivered through the replacement installed for
    /// `arch_do_signal_or_restart`, if any.
    ///
    /// The machine lock is never held while a replacement runs.
    pub fn access(&self, task: TaskId, access: Access) -> Result<AccessOutcome, Error> {
        let delivered = {
            let mut machine = self.lock();
            machine.set_current(task)?;
            machine.task_mut(task)?.registers.rip = access.ip.0;
            machine.delivered(task)?.len()
        };

        let mut faults = 0;

        let value = loop {
            if faults >= MAX_FAULTS {
                return Err(Error::FaultLoop(access.address));
            }

            let translation = self.lock().translate(task, &access)?;
            let fault = match translation {
                Translation::Mapped(pa) => break Some(self.perform(pa, access.kind)?),
                Translation::Segv => {
                    self.lock().raise(task, Signal::Segv)?;
                    break None;
                }
                Translation::Fault(fault) => fault,
            };

            faults += 1;

            let result = self.handle_fault(task, &fault);
            if !result.is_handled() {
                tracing::debug!(address = %fault.real_address, ?result, "fault not handled");
                self.lock().raise(task, signal_for(result))?;
                break None;
            }
        };

        let stepping = self.lock().task(task)?.registers.single_step();
        if value.is_some() && stepping {
            self.lock().raise(task, Signal::Trap)?;
        }

        self.exit_to_user(task)?;

        let signals = self.lock().delivered(task)?[delivered..].to_vec();

        Ok(AccessOutcome {
            value,
            faults,
            signals,
        })
    }

    fn perform(&self, pa: Pa, kind: AccessType) -> Result<u8, Error> {
        let pfn = Amd64::pfn_from_pa(pa);
        let offset = Amd64::pa_offset(pa);
        let mut machine = self.lock();

        match kind {
            AccessType::Fetch | AccessType::Read => machine
                .page(pfn)?
                .get(offset as usize)
                .copied()
                .ok_or(Error::OutOfBounds),
            AccessType::Write(value) => {
                machine.write(pfn, offset, &[value])?;
                Ok(value)
            }
        }
    }

    fn handle_fault(&self, task: TaskId, fault: &PteFault) -> FaultOutcome {
        let original = |fault: &PteFault| match self.lock().handle_fault(task, fault) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(address = %fault.real_address, %err, "fault handler failed");
                FaultOutcome::SIGBUS
            }
        };

        let replacement = self.lock().replacement(HANDLE_PTE_FAULT);
        match replacement {
            Some(replacement) => replacement.handle_pte_fault(fault, &original),
            None => original(fault),
        }
    }

    fn exit_to_user(&self, task: TaskId) -> Result<(), Error> {
        let (registers, replacement) = {
            let machine = self.lock();
            if !machine.sigpending(task)? {
                return Ok(());
            }

            (
                machine.task(task)?.registers,
                machine.replacement(ARCH_DO_SIGNAL_OR_RESTART),
            )
        };

        let original = |_: &Registers| {
            if let Err(err) = self.lock().deliver(task) {
                tracing::warn!(%task, %err, "signal delivery failed");
            }
        };

        match replacement {
            Some(replacement) => replacement.arch_do_signal_or_restart(&registers, &original),
            None => original(&registers),
        }

        Ok(())
    }
}

fn signal_for(outcome: FaultOutcome) -> Signal {
    if outcome.contains(FaultOutcome::SIGSEGV) {
        Signal::Segv
    } else {
        Signal::Bus
    }
}
