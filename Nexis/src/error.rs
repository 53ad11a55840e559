// error.rs

use core::fmt;

/// Failures that stop the kernel from booting.
///
/// Runtime problems (bad pid, double free, out of memory) are never errors of
/// this kind; those come back as `Option`/`bool` from the subsystem itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The backing store for the arena could not be reserved.
    ArenaUnavailable(usize),
    /// Arena size is zero or not a multiple of the page size.
    InvalidCapacity(usize),
    InvalidConfig(&'static str),
    /// The scheduler tick thread could not be started.
    TimerSpawn(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::ArenaUnavailable(size) => {
                write!(f, "unable to reserve a {} byte memory arena", size)
            }
            KernelError::InvalidCapacity(size) => {
                write!(f, "invalid arena capacity: {} bytes", size)
            }
            KernelError::InvalidConfig(why) => write!(f, "invalid configuration: {}", why),
            KernelError::TimerSpawn(why) => write!(f, "failed to start scheduler tick: {}", why),
        }
    }
}

impl std::error::Error for KernelError {}
