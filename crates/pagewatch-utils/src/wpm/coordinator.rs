use pagewatch_core::{KernelDriver, KernelError, Signal};

use super::{ActiveStep, Shared, WatchState, WatchpointManager};

impl<Driver> WatchpointManager<Driver>
where
    Driver: KernelDriver,
{
    /// Re-arms the watched page after the stepped instruction retired.
    ///
    /// Returns `false` when the kernel must still run its own signal
    /// delivery: the event does not belong to the target, or signals other
    /// than the step trap are pending.
    pub(super) fn service_trap(&self) -> Result<bool, KernelError> {
        let task = self.core.current_task()?;
        if task != self.target {
            return Ok(false);
        }

        let mut guard = self.lock();
        let shared = &mut *guard;

        let active = match shared.active.take() {
            Some(active) => active,
            None => {
                tracing::error!(%task, "signal delivery without a step in flight");
                return Ok(false);
            }
        };

        self.finish_step(shared, active)?;

        let pending = self.core.pending_signals(task)?;
        if !pending.is_empty() {
            tracing::debug!(%task, ?pending, "delivering remaining signals");
            return Ok(false);
        }

        Ok(true)
    }

    /// Ends the step: marks the page absent, disables stepping, and drops
    /// the step trap.
    ///
    /// Every part is attempted even if an earlier one fails. The first error
    /// is returned.
    fn finish_step(&self, shared: &mut Shared, active: ActiveStep) -> Result<(), KernelError> {
        let mut result = self.core.clear_leaf_present(active.entry);

        match (&result, shared.registry.find_by_leaf_entry_mut(active.entry)) {
            (Ok(()), Some(context)) => {
                context.state = WatchState::Armed;
                tracing::trace!(va = %context.va, "page re-armed");
            }
            (Err(err), Some(context)) => {
                tracing::error!(va = %context.va, %err, "failed to re-arm page");
            }
            (_, None) => tracing::error!(entry = %active.entry, "stepped entry is not watched"),
        }

        if let Err(err) = self
            .core
            .call_task_function(self.single_step.disable, active.task)
        {
            tracing::error!(task = %active.task, %err, "failed to disable single-stepping");
            result = result.and(Err(err));
        }

        if let Err(err) = self.core.suppress_signal(active.task, Signal::Trap) {
            tracing::error!(task = %active.task, %err, "failed to suppress step trap");
            result = result.and(Err(err));
        }

        result
    }
}
