mod address;
mod ids;
mod info;
pub(crate) mod macros;
mod memory_access;
mod region;
mod signal;

pub use self::{
    address::{AddressContext, Pa, Pfn, Va},
    ids::{CpuId, Pid, TaskId},
    info::KernelInfo,
    memory_access::MemoryAccess,
    region::Region,
    signal::{Signal, SignalSet},
};
