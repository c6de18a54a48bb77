use std::cell::Cell;

use pagewatch_arch_amd64::Registers;
use pagewatch_core::{
    CpuId, FaultFlags, FaultOutcome, KernelDriver as _, KernelError, KernelHooks, MemoryAccess,
    Pid, PteFault, Registers as _, Signal, Va,
};
use pagewatch_driver_sim::{Access, SimDriver};

use super::*;
use crate::wpm::{AccessCounters, WatchModule, WatchState};

///////////////////////////////////////////////////////////////////////////////
// Classification
///////////////////////////////////////////////////////////////////////////////

#[test]
fn data_read_sees_patch_and_fetch_sees_original() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    let manager = module.manager();

    // A data read from outside the page is served from the read backing.
    let outcome = sim.access(target.task, Access::read(ELSEWHERE, CODE + 0x10))?;
    assert_eq!(outcome.value, Some(original_byte(0x10)));
    assert_eq!(outcome.faults, 1);

    let outcome = sim.access(target.task, Access::read(ELSEWHERE, CODE + 0x155))?;
    assert_eq!(outcome.value, Some(0xde));

    let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(leaf(&target, CODE)?.pfn(), watch.read_backing());

    // An instruction fetch at the faulting address is served from the exec
    // backing.
    let outcome = sim.access(target.task, Access::fetch(CODE))?;
    assert_eq!(outcome.value, Some(original_byte(0)));
    assert_eq!(leaf(&target, CODE)?.pfn(), watch.exec_backing());
    assert_eq!(watch.exec_backing(), target.code);

    let outcome = sim.access(target.task, Access::fetch(CODE + 0x155))?;
    assert_eq!(outcome.value, Some(original_byte(0x155)));

    let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(
        watch.counters(),
        AccessCounters {
            forced_read: 0,
            instruction_fetch: 2,
            data_read: 2,
        }
    );

    module.exit()
}

#[test]
fn read_from_the_page_itself_is_a_data_read() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;

    // An instruction on the watched page reading another byte of it.
    let outcome = sim.access(target.task, Access::read(CODE + 0x20, CODE + 0x156))?;
    assert_eq!(outcome.value, Some(0xad));

    module.exit()
}

#[test]
fn marked_ip_forces_read_backing() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let config = config().with_marked_ip(CODE + 0x155);
    let module = WatchModule::init(sim.clone(), &config)?;
    let manager = module.manager();

    // A fetch at a marked instruction pointer sees the patched bytes.
    let outcome = sim.access(target.task, Access::fetch(CODE + 0x155))?;
    assert_eq!(outcome.value, Some(0xde));

    // Unmarked fetches are unaffected.
    let outcome = sim.access(target.task, Access::fetch(CODE + 0x154))?;
    assert_eq!(outcome.value, Some(original_byte(0x154)));

    let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(watch.counters().forced_read, 1);
    assert_eq!(watch.counters().instruction_fetch, 1);
    assert_eq!(watch.marked_ips(), [CODE + 0x155]);

    module.exit()
}

#[test]
fn writes_land_in_read_backing() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config().with_address(DATA))?;

    let outcome = sim.access(target.task, Access::write(ELSEWHERE, DATA + 8, 0x77))?;
    assert_eq!(outcome.value, Some(0x77));

    let outcome = sim.access(target.task, Access::read(ELSEWHERE, DATA + 8))?;
    assert_eq!(outcome.value, Some(0x77));

    // The original frame keeps its content.
    assert_eq!(sim.peek(target.data, 8)?, original_byte(8));

    module.exit()
}

///////////////////////////////////////////////////////////////////////////////
// Re-arming
///////////////////////////////////////////////////////////////////////////////

#[test]
fn every_access_rearms_the_page() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    let manager = module.manager();

    for round in 0..10u64 {
        let access = if round % 2 == 0 {
            Access::fetch(CODE + round)
        } else {
            Access::read(ELSEWHERE, CODE + round)
        };

        let outcome = sim.access(target.task, access)?;
        assert_eq!(outcome.value, Some(original_byte(round)));
        assert_eq!(outcome.faults, 1, "round {round}");
        assert!(outcome.signals.is_empty());

        assert!(!leaf(&target, CODE)?.present());
        assert_eq!(manager.active_step(), None);

        let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
        assert_eq!(watch.state(), WatchState::Armed);
    }

    let counters = manager
        .watch(CODE)
        .map(|watch| watch.counters())
        .unwrap_or_default();
    assert_eq!(counters.total(), 10);
    assert_eq!(sim.counters().traps, 10);

    module.exit()
}

#[test]
fn trap_is_consumed() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;

    sim.access(target.task, Access::fetch(CODE))?;

    let registers: Registers = module.manager().core().registers(target.task)?;
    assert!(!registers.single_step());
    assert!(module.manager().core().pending_signals(target.task)?.is_empty());
    assert!(sim.delivered_signals(target.task)?.is_empty());

    module.exit()
}

#[test]
fn every_entry_write_is_flushed() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;

    let before = sim.counters();
    sim.access(target.task, Access::read(ELSEWHERE, CODE))?;
    let after = sim.counters();

    // One write to install the backing, one to re-arm.
    assert_eq!(after.entry_writes - before.entry_writes, 2);
    assert_eq!(after.tlb_flushes - before.tlb_flushes, 2);
    assert_eq!(after.cache_invalidations - before.cache_invalidations, 2);

    module.exit()
}

#[test]
fn rearm_is_visible_on_every_cpu() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;

    for cpu in [0, 1, 0, 1] {
        sim.migrate(target.task, CpuId(cpu))?;

        let outcome = sim.access(target.task, Access::read(ELSEWHERE, CODE + 0x155))?;
        assert_eq!(outcome.value, Some(0xde));
        assert_eq!(outcome.faults, 1, "stale translation on cpu {cpu}");
    }

    module.exit()
}

///////////////////////////////////////////////////////////////////////////////
// Transparency
///////////////////////////////////////////////////////////////////////////////

#[test]
fn unwatched_pages_are_untouched() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    let manager = module.manager();

    let outcome = sim.access(target.task, Access::read(CODE, DATA + 0x155))?;
    assert_eq!(outcome.value, Some(original_byte(0x155)));
    assert_eq!(outcome.faults, 0);

    // Demand paging of the target still works through the hook.
    sim.add_region(target.task, Va(0x80_0000), Va(0x80_2000), MemoryAccess::RW)?;
    let outcome = sim.access(target.task, Access::read(CODE, Va(0x80_1000)))?;
    assert_eq!(outcome.value, Some(0));
    assert_eq!(outcome.faults, 1);

    // So does a fault of another process at the watched address.
    let other = sim.spawn(Pid(7));
    sim.add_region(other, CODE, CODE + 0x1000, MemoryAccess::RX)?;
    let outcome = sim.access(other, Access::fetch(CODE + 0x155))?;
    assert_eq!(outcome.value, Some(0));
    assert_eq!(outcome.faults, 1);

    let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(watch.counters().total(), 0);
    assert_eq!(watch.state(), WatchState::Armed);

    module.exit()
}

#[test]
fn other_signals_are_delivered() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;

    let outcome = sim.access(target.task, Access::write(CODE, CODE + 0x1000, 1))?;
    assert_eq!(outcome.value, None);
    assert_eq!(outcome.signals, [Signal::Segv]);

    module.exit()
}

#[test]
fn write_to_watched_code_page_is_segv() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    let manager = module.manager();

    // The read backing inherits the read-only mapping, so the stepped write
    // faults a second time and the kernel raises SIGSEGV.
    let outcome = sim.access(target.task, Access::write(ELSEWHERE, CODE + 8, 1))?;
    assert_eq!(outcome.value, None);
    assert_eq!(outcome.faults, 2);
    assert_eq!(outcome.signals, [Signal::Segv]);

    assert!(!leaf(&target, CODE)?.present());
    assert_eq!(manager.active_step(), None);
    assert!(manager.core().pending_signals(target.task)?.is_empty());

    let registers: Registers = manager.core().registers(target.task)?;
    assert!(!registers.single_step());

    let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(watch.state(), WatchState::Armed);
    assert_eq!(sim.peek(watch.read_backing(), 8)?, original_byte(8));

    // Nothing is left over for the next access.
    let outcome = sim.access(target.task, Access::read(ELSEWHERE, CODE + 8))?;
    assert_eq!(outcome.value, Some(original_byte(8)));
    assert!(outcome.signals.is_empty());

    module.exit()
}

///////////////////////////////////////////////////////////////////////////////
// Hook entry points
///////////////////////////////////////////////////////////////////////////////

#[test]
fn overlapping_fault_is_delegated() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config().with_address(DATA))?;
    let manager = module.manager();
    sim.set_current(target.task)?;

    let fault = PteFault {
        address: CODE,
        real_address: CODE + 0x10,
        pmd: pmd(&target, CODE)?,
        flags: FaultFlags::USER,
    };

    let outcome = manager.handle_pte_fault(&fault, &|_| FaultOutcome::SIGBUS);
    assert!(outcome.is_handled());
    assert!(manager.active_step().is_some());

    // The step over the first page is still in flight.
    let fault = PteFault {
        address: DATA,
        real_address: DATA,
        pmd: pmd(&target, DATA)?,
        flags: FaultFlags::USER,
    };

    let outcome = manager.handle_pte_fault(&fault, &|_| FaultOutcome::SIGBUS);
    assert_eq!(outcome, FaultOutcome::SIGBUS);

    let watch = manager.watch(DATA).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(watch.state(), WatchState::Armed);
    assert_eq!(watch.counters().total(), 0);

    module.exit()
}

#[test]
fn signal_hook_delegates_without_step() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    let manager = module.manager();

    let delegated = Cell::new(0);
    let original = |_: &Registers| delegated.set(delegated.get() + 1);

    // The target without a step in flight.
    sim.set_current(target.task)?;
    manager.arch_do_signal_or_restart(&Registers::default(), &original);
    assert_eq!(delegated.get(), 1);

    // Another task.
    let other = sim.spawn(Pid(7));
    sim.set_current(other)?;
    manager.arch_do_signal_or_restart(&Registers::default(), &original);
    assert_eq!(delegated.get(), 2);

    module.exit()
}

#[test]
fn remote_fault_is_delegated() -> Result<(), KernelError> {
    let target = target()?;
    let module = WatchModule::init(target.sim.clone(), &config())?;
    target.sim.set_current(target.task)?;

    let fault = PteFault {
        address: CODE,
        real_address: CODE,
        pmd: pmd(&target, CODE)?,
        flags: FaultFlags::USER | FaultFlags::REMOTE,
    };

    let outcome = module
        .manager()
        .handle_pte_fault(&fault, &|_| FaultOutcome::SIGSEGV);
    assert_eq!(outcome, FaultOutcome::SIGSEGV);
    assert_eq!(module.manager().active_step(), None);

    module.exit()
}

#[test]
fn failed_rearm_still_ends_step() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    let manager = module.manager();
    sim.set_current(target.task)?;

    let fault = PteFault {
        address: CODE,
        real_address: CODE + 0x155,
        pmd: pmd(&target, CODE)?,
        flags: FaultFlags::USER,
    };

    let outcome = manager.handle_pte_fault(&fault, &|_| FaultOutcome::SIGBUS);
    assert!(outcome.is_handled());
    sim.send_signal(target.task, Signal::Trap)?;

    sim.fail_entry_writes(true);

    let delegated = Cell::new(0);
    let original = |_: &Registers| delegated.set(delegated.get() + 1);
    manager.arch_do_signal_or_restart(&Registers::default(), &original);

    // The page stays present, but stepping ends and the trap is dropped.
    assert_eq!(delegated.get(), 1);
    assert_eq!(manager.active_step(), None);
    assert!(manager.core().pending_signals(target.task)?.is_empty());

    let registers: Registers = manager.core().registers(target.task)?;
    assert!(!registers.single_step());

    let watch = manager.watch(CODE).ok_or(KernelError::Other("page not watched"))?;
    assert_eq!(watch.state(), WatchState::Servicing);
    assert!(leaf(&target, CODE)?.present());

    sim.fail_entry_writes(false);
    module.exit()?;

    assert!(sim.delivered_signals(target.task)?.is_empty());
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Teardown
///////////////////////////////////////////////////////////////////////////////

#[test]
fn exit_restores_original_mapping() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let pages = sim.page_count();

    let module = WatchModule::init(sim.clone(), &config().with_address(DATA))?;
    sim.access(target.task, Access::read(ELSEWHERE, CODE))?;
    sim.access(target.task, Access::read(ELSEWHERE, DATA))?;

    let before = sim.counters();
    module.exit()?;

    // Both entries are restored with a single flush.
    assert_eq!(sim.counters().tlb_flushes - before.tlb_flushes, 1);

    for (va, frame) in [(CODE, target.code), (DATA, target.data)] {
        let leaf = leaf(&target, va)?;
        assert!(leaf.present());
        assert_eq!(leaf.pfn(), frame);
        assert_eq!(sim.pin_count(frame), 0);
    }

    assert_eq!(sim.page_count(), pages);
    assert!(!sim.is_intercepted(WatchModule::<SimDriver>::FAULT_HOOK));

    let outcome = sim.access(target.task, Access::read(ELSEWHERE, CODE + 0x155))?;
    assert_eq!(outcome.value, Some(original_byte(0x155)));
    assert_eq!(outcome.faults, 0);
    Ok(())
}

#[test]
fn exit_during_step() -> Result<(), KernelError> {
    let target = target()?;
    let sim = &target.sim;
    let module = WatchModule::init(sim.clone(), &config())?;
    sim.set_current(target.task)?;

    let fault = PteFault {
        address: CODE,
        real_address: CODE + 0x155,
        pmd: pmd(&target, CODE)?,
        flags: FaultFlags::USER,
    };

    let outcome = module
        .manager()
        .handle_pte_fault(&fault, &|_| FaultOutcome::SIGBUS);
    assert!(outcome.is_handled());

    let registers: Registers = module.manager().core().registers(target.task)?;
    assert!(registers.single_step());

    module.exit()?;

    let registers: Registers = sim.registers(target.task)?;
    assert!(!registers.single_step());

    let leaf = leaf(&target, CODE)?;
    assert!(leaf.present());
    assert_eq!(leaf.pfn(), target.code);

    let outcome = sim.access(target.task, Access::fetch(CODE + 0x155))?;
    assert_eq!(outcome.value, Some(original_byte(0x155)));
    assert!(outcome.signals.is_empty());
    Ok(())
}
