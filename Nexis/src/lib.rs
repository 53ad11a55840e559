pub mod config;
pub mod error;
pub mod memory;
pub mod paging;
pub mod process;
pub mod task;
pub mod scheduler;
pub mod pit;
pub mod fs;
pub mod syscall;
pub mod kernel;

pub use config::{AllocationStrategy, KernelConfig};
pub use error::KernelError;
pub use kernel::Kernel;
pub use memory::{MemoryManager, PhysAddr};
pub use paging::{PageMapper, VirtAddr};
pub use process::{Pid, ProcState, ProcessInfo};
pub use scheduler::Scheduler;
pub use syscall::{Syscall, SyscallParams};
