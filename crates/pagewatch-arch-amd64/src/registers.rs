use super::{Amd64, Rflags};

/// The user register frame of a task (`struct pt_regs`).
#[expect(missing_docs)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: Rflags,
}

impl Registers {
    /// Creates a register frame positioned at `rip`.
    pub fn at(rip: u64) -> Self {
        Self {
            rip,
            rflags: Rflags(Rflags::FIXED_BITS),
            ..Default::default()
        }
    }
}

impl pagewatch_core::arch::Registers for Registers {
    type Architecture = Amd64;

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn single_step(&self) -> bool {
        self.rflags.trap()
    }

    fn set_single_step(&mut self, enabled: bool) {
        self.rflags = self.rflags.with_trap(enabled);
    }
}
