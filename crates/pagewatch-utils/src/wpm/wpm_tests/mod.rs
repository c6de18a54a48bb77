mod lifecycle;
mod watchpoint;

use pagewatch_arch_amd64::{Amd64, PageTableEntry, PageTableLevel};
use pagewatch_core::{
    AddressContext, KernelCore, KernelError, MemoryAccess, Pa, Pfn, Pid, TaskId, Va,
};
use pagewatch_driver_sim::SimDriver;

use super::{ContentPatch, WatchConfig};

///////////////////////////////////////////////////////////////////////////////
// Target process
///////////////////////////////////////////////////////////////////////////////

const PID: Pid = Pid(4242);
const CODE: Va = Va(0x40_1000);
const DATA: Va = Va(0x60_0000);

/// An instruction pointer outside of every watched page.
const ELSEWHERE: Va = Va(0x7f00_0000_1000);

const PATCH_OFFSET: u64 = 0x155;
const PATCH: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

struct Target {
    sim: SimDriver,
    task: TaskId,
    code: Pfn,
    data: Pfn,
}

/// The byte the target's pages hold at `offset` before any patching.
fn original_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A process with one executable and one writable page.
fn target() -> Result<Target, KernelError> {
    init_tracing();

    let sim = SimDriver::new();
    let task = sim.spawn(PID);

    let content = (0..0x1000).map(original_byte).collect::<Vec<_>>();
    let code = sim.map(task, CODE, &content, MemoryAccess::RX)?;
    let data = sim.map(task, DATA, &content, MemoryAccess::RW)?;

    Ok(Target {
        sim,
        task,
        code,
        data,
    })
}

fn config() -> WatchConfig {
    WatchConfig::new(PID)
        .with_address(CODE)
        .with_patches(ContentPatch::sequence(PATCH_OFFSET, &PATCH))
}

fn leaf(target: &Target, va: Va) -> Result<PageTableEntry, KernelError> {
    Ok(target
        .sim
        .leaf_value(target.task, va)?
        .ok_or(KernelError::UnresolvedTranslation(va))?)
}

/// Returns the address of the page directory entry covering `va`.
fn pmd(target: &Target, va: Va) -> Result<Pa, KernelError> {
    let core = KernelCore::new(target.sim.clone())?;
    let root = core.translation_root(target.task)?;

    Amd64::translation(&core, AddressContext::new(va, root))
        .entries()
        .iter()
        .find(|entry| entry.level == PageTableLevel::Pd)
        .map(|entry| entry.entry_address)
        .ok_or(KernelError::UnresolvedTranslation(va))
}
