use pagewatch::{
    KernelError, MemoryAccess, Pid, Va,
    driver::sim::{Access, SimDriver},
    utils::wpm::{ContentPatch, WatchConfig, WatchModule},
};

const CODE: Va = Va(0x40_1000);

fn main() -> Result<(), KernelError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    // A process with one executable page.
    let sim = SimDriver::new();
    let task = sim.spawn(Pid(1000));

    let mut code = vec![0x90u8; 0x1000];
    code[0x155..0x159].copy_from_slice(&[0x48, 0x89, 0xe5, 0xc3]);
    sim.map(task, CODE, &code, MemoryAccess::RX)?;

    let config = WatchConfig::new(Pid(1000))
        .with_address(CODE)
        .with_patches(ContentPatch::sequence(0x155, &[0xde, 0xad, 0xbe, 0xef]));

    let module = WatchModule::init(sim.clone(), &config)?;

    // The page executes its own code, but reads of it see the patch.
    let fetch = sim.access(task, Access::fetch(CODE + 0x155))?;
    let read = sim.access(task, Access::read(Va(0x50_0000), CODE + 0x155))?;

    println!("fetch: {:#04x?}", fetch.value);
    println!("read:  {:#04x?}", read.value);

    if let Some(watch) = module.manager().watch(CODE) {
        println!("{:#?}", watch.counters());
    }

    module.exit()
}
