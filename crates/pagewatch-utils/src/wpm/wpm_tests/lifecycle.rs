use pagewatch_core::{KernelError, MemoryAccess, Pid, SymbolResolver as _, Va};
use pagewatch_driver_sim::{Access, SimDriver};

use super::*;
use crate::wpm::{SingleStep, WatchConfig, WatchModule, WatchState};

type Module = WatchModule<SimDriver>;

/// Checks that a failed load left nothing behind.
fn assert_released(target: &Target, pages: usize) -> Result<(), KernelError> {
    assert_eq!(target.sim.page_count(), pages);
    assert_eq!(target.sim.pin_count(target.code), 0);
    assert_eq!(target.sim.pin_count(target.data), 0);
    assert!(!target.sim.is_intercepted(Module::FAULT_HOOK));
    assert!(!target.sim.is_intercepted(Module::SIGNAL_HOOK));

    for va in [CODE, DATA] {
        assert!(leaf(target, va)?.present(), "{va} left absent");
    }

    Ok(())
}

#[test]
fn load_and_unload() -> Result<(), KernelError> {
    let target = target()?;
    let module = Module::init(target.sim.clone(), &config().with_address(DATA))?;

    assert!(target.sim.is_intercepted(Module::FAULT_HOOK));
    assert!(target.sim.is_intercepted(Module::SIGNAL_HOOK));
    assert_eq!(
        module.hooks().names().collect::<Vec<_>>(),
        [Module::FAULT_HOOK, Module::SIGNAL_HOOK]
    );

    let manager = module.manager();
    assert_eq!(manager.with_registry(|registry| registry.len()), 2);

    for va in [CODE, DATA] {
        let watch = manager.watch(va).ok_or(KernelError::Other("page not watched"))?;
        assert_eq!(watch.state(), WatchState::Armed);
        assert_eq!(watch.region().start, va);
        assert!(!leaf(&target, va)?.present());
        assert_eq!(target.sim.pin_count(watch.exec_backing()), 1);
    }

    let pages = target.sim.page_count();
    module.exit()?;

    assert_released(&target, pages - 2)
}

#[test]
fn hooks_route_to_manager() -> Result<(), KernelError> {
    let target = target()?;
    let module = Module::init(target.sim.clone(), &config())?;

    assert_eq!(
        module.hooks().original(Module::FAULT_HOOK),
        target.sim.lookup_name(Module::FAULT_HOOK)
    );

    // The simulator dispatches to the installed manager by itself.
    let outcome = target
        .sim
        .access(target.task, Access::read(ELSEWHERE, CODE + 0x155))?;
    assert_eq!(outcome.value, Some(0xde));
    assert_eq!(outcome.faults, 1);

    module.exit()?;

    let outcome = target
        .sim
        .access(target.task, Access::read(ELSEWHERE, CODE + 0x155))?;
    assert_eq!(outcome.value, Some(original_byte(0x155)));
    assert_eq!(outcome.faults, 0);
    Ok(())
}

#[test]
fn config_from_json() -> Result<(), KernelError> {
    let target = target()?;

    let config = serde_json::from_str::<WatchConfig>(
        r#"{
            "pid": 4242,
            "addresses": [4198400],
            "patches": [{ "offset": 341, "value": 222 }]
        }"#,
    )
    .map_err(|_| KernelError::InvalidConfig("malformed"))?;

    let module = Module::init(target.sim.clone(), &config)?;

    let outcome = target
        .sim
        .access(target.task, Access::read(ELSEWHERE, CODE + 0x155))?;
    assert_eq!(outcome.value, Some(0xde));

    module.exit()
}

#[test]
fn invalid_config() -> Result<(), KernelError> {
    let target = target()?;

    let result = Module::init(target.sim.clone(), &WatchConfig::new(PID));
    assert!(matches!(result, Err(KernelError::InvalidConfig(_))));

    let config = config().with_patches([ContentPatch::new(0x1000, 0)]);
    let result = Module::init(target.sim.clone(), &config);
    assert!(matches!(result, Err(KernelError::InvalidConfig(_))));
    Ok(())
}

#[test]
fn unknown_process() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();

    let config = WatchConfig::new(Pid(1)).with_address(CODE);
    let result = Module::init(target.sim.clone(), &config);
    assert!(matches!(result, Err(KernelError::TaskNotFound(Pid(1)))));

    assert_released(&target, pages)
}

#[test]
fn missing_single_step_symbol() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();
    target.sim.remove_symbol(SingleStep::DISABLE);

    let result = Module::init(target.sim.clone(), &config());
    assert!(matches!(
        result,
        Err(KernelError::SymbolNotFound("user_disable_single_step"))
    ));

    assert_released(&target, pages)
}

#[test]
fn hook_refusal_rolls_back() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();
    target.sim.refuse_hook(Module::SIGNAL_HOOK);

    let result = Module::init(target.sim.clone(), &config().with_address(DATA));
    assert!(matches!(
        result,
        Err(KernelError::HookInstall("arch_do_signal_or_restart"))
    ));

    assert_released(&target, pages)
}

#[test]
fn allocation_failure_releases_earlier_watches() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();

    // Enough for the first read backing only.
    target.sim.set_allocation_limit(Some(1));

    let result = Module::init(target.sim.clone(), &config().with_address(DATA));
    assert!(matches!(result, Err(KernelError::AllocationFailure(DATA))));

    target.sim.set_allocation_limit(None);
    assert_released(&target, pages)
}

#[test]
fn unpopulated_page_cannot_be_pinned() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();

    // The page shares a page table with `DATA` but was never touched.
    let va = DATA + 0x1000;
    target
        .sim
        .add_region(target.task, va, va + 0x1000, MemoryAccess::RW)?;

    let result = Module::init(target.sim.clone(), &config().with_address(va));
    assert!(matches!(result, Err(KernelError::AllocationFailure(v)) if v == va));

    assert_released(&target, pages)
}

#[test]
fn address_outside_any_region() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();

    let result = Module::init(target.sim.clone(), &config().with_address(CODE + 0x1000));
    assert!(matches!(result, Err(KernelError::UnmappedRegion(v)) if v == CODE + 0x1000));

    assert_released(&target, pages)
}

#[test]
fn address_without_page_tables() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();

    let va = Va(0x7fff_0000_0000);
    let result = Module::init(target.sim.clone(), &config().with_address(va));
    assert!(matches!(result, Err(KernelError::UnresolvedTranslation(v)) if v == va));

    assert_released(&target, pages)
}

#[test]
fn duplicate_page() -> Result<(), KernelError> {
    let target = target()?;
    let pages = target.sim.page_count();

    let result = Module::init(target.sim.clone(), &config().with_address(CODE + 0x10));
    assert!(matches!(result, Err(KernelError::AlreadyWatched(CODE))));

    assert_released(&target, pages)
}
