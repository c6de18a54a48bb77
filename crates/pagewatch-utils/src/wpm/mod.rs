//! Software watchpoint manager.
//!
//! Watches pages of a single process without debug registers. Every watched
//! page has its leaf entry marked absent, so any access to it faults. The
//! fault is classified and serviced with one of two backings:
//!
//! - the **exec backing**, the original frame of the page, installed for
//!   instruction fetches,
//! - the **read backing**, a patched copy of the original frame, installed
//!   for everything else.
//!
//! After the backing is installed and marked present, the faulting thread is
//! single-stepped. Once the instruction retires, the resulting trap is
//! intercepted on its way to user mode: the entry is marked absent again,
//! stepping is disabled, and the trap signal is discarded.
//!
//! # Components
//!
//! - [`WatchRegistry`] owns the watched pages ([`WatchContext`]).
//! - [`WatchpointManager`] implements [`KernelHooks`] and holds the
//!   registry together with the single in-flight step.
//! - [`WatchModule`] drives the lifecycle: symbol resolution, registration,
//!   hook installation, and teardown.
//!
//! # Limitations
//!
//! Only one step can be in flight at a time. A fault on a watched page while
//! another step is outstanding is logged and delegated to the kernel. So is
//! a second fault of the stepped instruction itself, and any signal pending
//! besides the step trap is left for the kernel to deliver.
//!
//! [`KernelHooks`]: pagewatch_core::KernelHooks

mod classifier;
mod config;
mod context;
mod coordinator;
mod module;
mod registry;

#[cfg(test)]
mod wpm_tests;

use std::sync::{Mutex, MutexGuard, PoisonError};

use pagewatch_core::{
    Architecture, FaultOutcome, KernelCore, KernelDriver, KernelError, KernelHooks, LeafEntry,
    PteFault, Signal, SymbolResolver, TaskId, Va,
};

pub use self::{
    config::{ContentPatch, WatchConfig},
    context::{AccessCounters, AccessKind, MarkedIps, WatchContext, WatchState},
    module::WatchModule,
    registry::WatchRegistry,
};

/// Maximum number of marked instruction pointers per watched page.
pub const MAX_MARKED_IPS: usize = 16;

/// Kernel functions arming and disarming single-stepping of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SingleStep {
    /// Address of `user_enable_single_step`.
    pub enable: Va,

    /// Address of `user_disable_single_step`.
    pub disable: Va,
}

impl SingleStep {
    /// Name of the function enabling single-stepping.
    pub const ENABLE: &'static str = "user_enable_single_step";

    /// Name of the function disabling single-stepping.
    pub const DISABLE: &'static str = "user_disable_single_step";

    /// Resolves both functions.
    pub fn resolve<Resolver>(resolver: &Resolver) -> Result<Self, KernelError>
    where
        Resolver: SymbolResolver + ?Sized,
    {
        let lookup = |name: &'static str| {
            resolver.lookup_name(name).ok_or_else(|| {
                tracing::error!(name, "symbol not found");
                KernelError::SymbolNotFound(name)
            })
        };

        Ok(Self {
            enable: lookup(Self::ENABLE)?,
            disable: lookup(Self::DISABLE)?,
        })
    }
}

/// The thread currently single-stepping over a watched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveStep {
    /// The leaf entry of the page being stepped over.
    pub entry: LeafEntry,

    /// The stepping task.
    pub task: TaskId,
}

#[derive(Debug, Default)]
struct Shared {
    registry: WatchRegistry,
    active: Option<ActiveStep>,
}

/// Watchpoint manager.
///
/// Implements the fault and signal-delivery hooks for one tracked task.
/// The registry and the in-flight step are guarded by a single mutex, so
/// concurrent faults from several threads of the target are serialized.
pub struct WatchpointManager<Driver>
where
    Driver: KernelDriver,
{
    core: KernelCore<Driver>,
    target: TaskId,
    single_step: SingleStep,
    shared: Mutex<Shared>,
}

impl<Driver> WatchpointManager<Driver>
where
    Driver: KernelDriver,
{
    /// Creates a manager tracking `target` with an already populated
    /// registry.
    pub fn new(
        core: KernelCore<Driver>,
        target: TaskId,
        single_step: SingleStep,
        registry: WatchRegistry,
    ) -> Self {
        Self {
            core,
            target,
            single_step,
            shared: Mutex::new(Shared {
                registry,
                active: None,
            }),
        }
    }

    /// Returns the kernel access layer.
    pub fn core(&self) -> &KernelCore<Driver> {
        &self.core
    }

    /// Returns the tracked task.
    pub fn target(&self) -> TaskId {
        self.target
    }

    /// Returns the resolved single-step functions.
    pub fn single_step(&self) -> SingleStep {
        self.single_step
    }

    /// Returns the step currently in flight, if any.
    pub fn active_step(&self) -> Option<ActiveStep> {
        self.lock().active
    }

    /// Runs `f` with the registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&WatchRegistry) -> R) -> R {
        f(&self.lock().registry)
    }

    /// Returns a copy of the context of the watched page starting at `va`.
    pub fn watch(&self, va: Va) -> Option<WatchContext> {
        self.lock().registry.find_by_va(va).cloned()
    }

    /// Marks every watched page absent.
    pub fn disarm_all(&self) -> Result<(), KernelError> {
        let mut shared = self.lock();
        shared.registry.disarm_all(&self.core)
    }

    /// Cancels the step in flight and releases every watched page.
    ///
    /// Safe to call while a step is in flight: stepping is disabled and the
    /// pending trap is discarded before the pages are released. Cleanup
    /// continues past failures, and the first error is returned.
    pub fn teardown(&self) -> Result<(), KernelError> {
        let mut guard = self.lock();
        let shared = &mut *guard;
        let mut result = Ok(());

        if let Some(active) = shared.active.take() {
            tracing::warn!(entry = %active.entry, task = %active.task, "cancelling step in flight");

            let cancelled = self
                .core
                .call_task_function(self.single_step.disable, active.task)
                .and_then(|()| self.core.suppress_signal(active.task, Signal::Trap));

            if let Err(err) = cancelled {
                tracing::warn!(%err, "failed to cancel step");
                result = result.and(Err(err));
            }
        }

        result.and(shared.registry.teardown(&self.core))
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<Driver> KernelHooks<Driver::Architecture> for WatchpointManager<Driver>
where
    Driver: KernelDriver,
{
    fn handle_pte_fault(
        &self,
        fault: &PteFault,
        original: &dyn Fn(&PteFault) -> FaultOutcome,
    ) -> FaultOutcome {
        match self.service_fault(fault) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => original(fault),
            Err(err) => {
                tracing::warn!(address = %fault.real_address, %err, "fault not serviced");
                original(fault)
            }
        }
    }

    fn arch_do_signal_or_restart(
        &self,
        registers: &<Driver::Architecture as Architecture>::Registers,
        original: &dyn Fn(&<Driver::Architecture as Architecture>::Registers),
    ) {
        match self.service_trap() {
            Ok(true) => {}
            Ok(false) => original(registers),
            Err(err) => {
                tracing::warn!(%err, "trap not serviced");
                original(registers)
            }
        }
    }
}

impl<Driver> std::fmt::Debug for WatchpointManager<Driver>
where
    Driver: KernelDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WatchpointManager")
            .field("target", &self.target)
            .field("single_step", &self.single_step)
            .finish_non_exhaustive()
    }
}
