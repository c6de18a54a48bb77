use pagewatch_core::{
    Architecture as _, FaultOutcome, KernelDriver, KernelError, PteFault, Registers as _,
    TaskId, Va,
};

use super::{AccessKind, ActiveStep, WatchState, WatchpointManager};

impl<Driver> WatchpointManager<Driver>
where
    Driver: KernelDriver,
{
    /// Services a fault on a watched page.
    ///
    /// Returns `None` when the fault does not belong to a watched page of
    /// the target and must be handled by the kernel.
    pub(super) fn service_fault(
        &self,
        fault: &PteFault,
    ) -> Result<Option<FaultOutcome>, KernelError> {
        let task = self.core.current_task()?;
        if task != self.target || fault.is_remote() {
            return Ok(None);
        }

        let entry =
            match Driver::Architecture::leaf_entry_from_pmd(&self.core, fault.pmd, fault.address)? {
                Some(entry) => entry,
                None => return Ok(None),
            };

        let mut guard = self.lock();
        let shared = &mut *guard;

        let context = match shared.registry.find_by_leaf_entry_mut(entry) {
            Some(context) => context,
            None => return Ok(None),
        };

        if let Some(active) = shared.active {
            // The stepped instruction faulted again on its own page, e.g. a
            // write to a read-only backing. The kernel decides its fate.
            if active.entry == entry {
                tracing::debug!(
                    va = %context.va,
                    address = %fault.real_address,
                    "fault during step"
                );
                return Ok(None);
            }

            tracing::error!(
                va = %context.va,
                active = %active.entry,
                "fault on a watched page while another step is in flight"
            );
            return Ok(None);
        }

        let ip = Va(self.core.registers(task)?.instruction_pointer());
        let kind = AccessKind::classify(&context.marked_ips, ip, fault.real_address);
        let backing = context.select_backing(kind);

        tracing::debug!(%ip, address = %fault.real_address, ?kind, %backing, "access classified");

        self.core.install_leaf(entry, backing)?;
        context.state = WatchState::Servicing;
        context.counters.record(kind);

        if let Err(err) = self.arm_single_step(task) {
            // Without a trap the page would stay present forever.
            if let Err(err) = self.core.clear_leaf_present(entry) {
                tracing::error!(va = %context.va, %err, "failed to disarm page");
            }

            context.state = WatchState::Armed;
            return Err(err);
        }

        shared.active = Some(ActiveStep { entry, task });
        Ok(Some(FaultOutcome::HANDLED))
    }

    fn arm_single_step(&self, task: TaskId) -> Result<(), KernelError> {
        self.core.call_task_function(self.single_step.enable, task)
    }
}
