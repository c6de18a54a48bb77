use std::sync::Arc;

use pagewatch_core::{
    FunctionInterceptor, KernelCore, KernelDriver, KernelError, SharedHooks, SymbolResolver,
};

use super::{SingleStep, WatchConfig, WatchRegistry, WatchpointManager};
use crate::interceptor::HookBatch;

/// A loaded watchpoint module.
///
/// Owns the [`WatchpointManager`] and the redirections of the kernel
/// functions to it. The interceptor holds a reference to the manager for as
/// long as the hooks are installed. Dropping the module without calling
/// [`exit`] leaves the hooks installed and the pages armed.
///
/// [`exit`]: Self::exit
pub struct WatchModule<Driver>
where
    Driver: KernelDriver
        + SymbolResolver
        + FunctionInterceptor<<Driver as KernelDriver>::Architecture>,
    Driver: Send + Sync + 'static,
{
    manager: Arc<WatchpointManager<Driver>>,
    hooks: HookBatch<Driver::Architecture>,
}

impl<Driver> WatchModule<Driver>
where
    Driver: KernelDriver
        + SymbolResolver
        + FunctionInterceptor<<Driver as KernelDriver>::Architecture>,
    Driver: Send + Sync + 'static,
{
    /// The page fault entry point.
    pub const FAULT_HOOK: &'static str = "handle_pte_fault";

    /// The signal delivery entry point on the return to user mode.
    pub const SIGNAL_HOOK: &'static str = "arch_do_signal_or_restart";

    /// Loads the module.
    ///
    /// Resolves the single-step functions and the target task, registers
    /// every configured address, redirects both hooks to the manager, and
    /// finally arms every watched page. Nothing stays installed or allocated
    /// when an error is returned.
    pub fn init(driver: Driver, config: &WatchConfig) -> Result<Self, KernelError> {
        tracing::info!(pid = %config.pid, addresses = config.addresses.len(), "loading");

        let core = KernelCore::new(driver)?;
        config.validate(core.info().page_size)?;

        let single_step = SingleStep::resolve(core.driver())?;
        let target = core.find_task(config.pid)?;

        let mut registry = WatchRegistry::new();
        for &va in &config.addresses {
            if let Err(err) =
                registry.register(&core, target, va, &config.marked_ips, &config.patches)
            {
                tracing::error!(%va, %err, "failed to register watch");
                Self::release(&core, &mut registry);
                return Err(err);
            }
        }

        let manager = Arc::new(WatchpointManager::new(core, target, single_step, registry));
        let replacement: SharedHooks<Driver::Architecture> = manager.clone();

        let hooks = match HookBatch::install(
            manager.core().driver(),
            &[Self::FAULT_HOOK, Self::SIGNAL_HOOK],
            replacement,
        ) {
            Ok(hooks) => hooks,
            Err(err) => {
                if let Err(err) = manager.teardown() {
                    tracing::warn!(%err, "failed to release watches");
                }

                return Err(err);
            }
        };

        let module = Self { manager, hooks };

        if let Err(err) = module.manager.disarm_all() {
            tracing::error!(%err, "failed to arm watched pages");

            if let Err(err) = module.exit() {
                tracing::warn!(%err, "failed to unload");
            }

            return Err(err);
        }

        tracing::info!(pid = %config.pid, task = %target, "loaded");
        Ok(module)
    }

    /// Returns the watchpoint manager.
    pub fn manager(&self) -> &WatchpointManager<Driver> {
        &self.manager
    }

    /// Returns the installed hooks.
    pub fn hooks(&self) -> &HookBatch<Driver::Architecture> {
        &self.hooks
    }

    /// Unloads the module.
    ///
    /// Removes the hooks before releasing the watched pages, so no fault or
    /// trap is serviced against a page being released. Cleanup continues
    /// past failures, and the first error is returned.
    pub fn exit(self) -> Result<(), KernelError> {
        let Self { manager, hooks } = self;

        let result = hooks
            .remove_all(manager.core().driver())
            .and(manager.teardown());

        tracing::info!(task = %manager.target(), "unloaded");
        result
    }

    fn release(core: &KernelCore<Driver>, registry: &mut WatchRegistry) {
        if let Err(err) = registry.teardown(core) {
            tracing::warn!(%err, "failed to release watches");
        }
    }
}

impl<Driver> std::fmt::Debug for WatchModule<Driver>
where
    Driver: KernelDriver
        + SymbolResolver
        + FunctionInterceptor<<Driver as KernelDriver>::Architecture>,
    Driver: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("WatchModule")
            .field("manager", &self.manager)
            .field("hooks", &self.hooks)
            .finish()
    }
}
