use std::sync::Arc;

use crate::{Architecture, FaultOutcome, PteFault};

/// Replacement handlers for the two kernel entry points a watchpoint
/// manager redirects.
///
/// Each handler receives the original implementation so it can delegate
/// events it does not own. Handlers run in fault and signal-delivery context
/// and must never fail: anything unexpected resolves to calling `original`.
pub trait KernelHooks<Arch>
where
    Arch: Architecture,
{
    /// Replacement for `handle_pte_fault`.
    fn handle_pte_fault(
        &self,
        fault: &PteFault,
        original: &dyn Fn(&PteFault) -> FaultOutcome,
    ) -> FaultOutcome;

    /// Replacement for `arch_do_signal_or_restart`.
    fn arch_do_signal_or_restart(
        &self,
        registers: &Arch::Registers,
        original: &dyn Fn(&Arch::Registers),
    );
}

/// Replacement handlers shared with a [`FunctionInterceptor`].
///
/// [`FunctionInterceptor`]: crate::FunctionInterceptor
pub type SharedHooks<Arch> = Arc<dyn KernelHooks<Arch> + Send + Sync>;
