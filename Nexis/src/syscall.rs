// syscall.rs

use log::{debug, info, warn};
use num_enum::TryFromPrimitive;

use crate::fs::Fd;
use crate::kernel::Kernel;
use crate::memory::PhysAddr;

pub const STDIN: u64 = 0;
pub const STDOUT: u64 = 1;
pub const STDERR: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum Syscall {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Fork = 4,
    Exec = 5,
    Exit = 6,
    Malloc = 7,
    Free = 8,
    GetPid = 9,
    Kill = 10,
}

/// Parameter block handed to [`dispatch`]. Which fields matter depends on the
/// call; unused ones are ignored.
#[derive(Clone, Debug, Default)]
pub struct SyscallParams {
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    /// Arena address for calls that move bytes (READ, WRITE, FREE).
    pub pointer: u64,
    pub string: Option<String>,
}

impl SyscallParams {
    pub fn args(arg1: u64, arg2: u64) -> Self {
        Self {
            arg1,
            arg2,
            ..Self::default()
        }
    }

    pub fn with_string(s: &str) -> Self {
        Self {
            string: Some(s.to_string()),
            ..Self::default()
        }
    }
}

/// Run syscall `number` against `kernel`. Failures are `-1`, never a panic.
pub fn dispatch(kernel: &Kernel, number: u64, params: &SyscallParams) -> i64 {
    let call = match Syscall::try_from(number) {
        Ok(call) => call,
        Err(_) => {
            warn!(target: "syscall", "unknown system call: {}", number);
            return -1;
        }
    };
    debug!(target: "syscall", "{:?} {:?}", call, params);
    match call {
        Syscall::Read => sys_read(kernel, params),
        Syscall::Write => sys_write(kernel, params),
        Syscall::Open => sys_open(kernel, params),
        Syscall::Close => sys_close(kernel, params),
        Syscall::Fork => pid_or_error(kernel.create_process("forked_process")),
        Syscall::Exec => match params.string.as_deref() {
            Some(path) => pid_or_error(kernel.create_process(path)),
            None => -1,
        },
        Syscall::Exit => sys_exit(kernel, params),
        Syscall::Malloc => sys_malloc(kernel, params),
        Syscall::Free => {
            kernel.free_memory(PhysAddr(params.pointer as usize));
            0
        }
        Syscall::GetPid => kernel.scheduler().current_pid().map_or(0, i64::from),
        Syscall::Kill => sys_kill(kernel, params),
    }
}

fn pid_or_error(pid: Option<u32>) -> i64 {
    pid.map_or(-1, i64::from)
}

fn as_fd(n: u64) -> Option<Fd> {
    Fd::try_from(n).ok()
}

fn sys_read(kernel: &Kernel, p: &SyscallParams) -> i64 {
    if p.arg1 == STDIN {
        return 0;
    }
    let count = match usize::try_from(p.arg2) {
        Ok(count) => count,
        Err(_) => return -1,
    };
    let dest = PhysAddr(p.pointer as usize);
    // Checked up front so a bad buffer leaves the file position alone.
    if !kernel.memory().validate_range(dest, count) {
        warn!(target: "syscall", "read buffer {:#x} is not a valid arena range", p.pointer);
        return -1;
    }
    let bytes = match as_fd(p.arg1).and_then(|fd| kernel.fs().read_fd(fd, count)) {
        Some(bytes) => bytes,
        None => {
            warn!(target: "syscall", "read from bad descriptor {}", p.arg1);
            return -1;
        }
    };
    if bytes.is_empty() {
        return 0;
    }
    if !kernel.memory().write(dest, &bytes) {
        warn!(target: "syscall", "read buffer {:#x} is not a valid arena range", p.pointer);
        return -1;
    }
    bytes.len() as i64
}

fn sys_write(kernel: &Kernel, p: &SyscallParams) -> i64 {
    let bytes = match &p.string {
        // A zero count means the whole string.
        Some(s) => {
            let len = match p.arg2 as usize {
                0 => s.len(),
                n => n.min(s.len()),
            };
            s.as_bytes()[..len].to_vec()
        }
        None => match kernel.memory().read(PhysAddr(p.pointer as usize), p.arg2 as usize) {
            Some(bytes) => bytes,
            None => {
                warn!(target: "syscall", "write buffer {:#x} is not a valid arena range", p.pointer);
                return -1;
            }
        },
    };

    match p.arg1 {
        STDOUT | STDERR => {
            info!(target: "app", "{}", String::from_utf8_lossy(&bytes).trim_end());
            bytes.len() as i64
        }
        STDIN => -1,
        fd => match as_fd(fd).and_then(|fd| kernel.fs().write_fd(fd, &bytes)) {
            Some(n) => n as i64,
            None => {
                warn!(target: "syscall", "write to bad descriptor {}", fd);
                -1
            }
        },
    }
}

fn sys_open(kernel: &Kernel, p: &SyscallParams) -> i64 {
    let path = match p.string.as_deref() {
        Some(path) => path,
        None => return -1,
    };
    debug!(target: "syscall", "open {} flags={:#x}", path, p.arg1);
    kernel.fs().open(path, true).map_or(-1, i64::from)
}

fn sys_close(kernel: &Kernel, p: &SyscallParams) -> i64 {
    match as_fd(p.arg1) {
        Some(fd) if kernel.fs().close(fd) => 0,
        _ => -1,
    }
}

fn sys_exit(kernel: &Kernel, p: &SyscallParams) -> i64 {
    match kernel.scheduler().current_pid() {
        Some(pid) => {
            info!(target: "syscall", "process {} exited with status {}", pid, p.arg1 as i64);
            if kernel.terminate_process(pid) {
                0
            } else {
                -1
            }
        }
        None => -1,
    }
}

fn sys_malloc(kernel: &Kernel, p: &SyscallParams) -> i64 {
    usize::try_from(p.arg1)
        .ok()
        .and_then(|size| kernel.allocate_memory(size))
        .map_or(0, |addr| addr.as_usize() as i64)
}

fn sys_kill(kernel: &Kernel, p: &SyscallParams) -> i64 {
    let pid = match u32::try_from(p.arg1) {
        Ok(pid) => pid,
        Err(_) => return -1,
    };
    let signal = p.arg2 as i32;
    if kernel.scheduler().send_signal(pid, signal) {
        0
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn kernel() -> Kernel {
        Kernel::boot(KernelConfig::quick()).unwrap()
    }

    #[test]
    fn numbers_match_the_table() {
        assert_eq!(Syscall::try_from(0).ok(), Some(Syscall::Read));
        assert_eq!(Syscall::try_from(9).ok(), Some(Syscall::GetPid));
        assert_eq!(Syscall::try_from(10).ok(), Some(Syscall::Kill));
        assert!(Syscall::try_from(11).is_err());
    }

    #[test]
    fn unknown_number_has_no_side_effects() {
        let k = kernel();
        let used = k.memory().used_memory();
        assert_eq!(dispatch(&k, 99, &SyscallParams::args(4096, 0)), -1);
        assert_eq!(k.memory().used_memory(), used);
        assert_eq!(k.scheduler().process_count(), 0);
    }

    #[test]
    fn malloc_then_free() {
        let k = kernel();
        let addr = dispatch(&k, Syscall::Malloc as u64, &SyscallParams::args(100, 0));
        assert!(addr > 0);
        assert_eq!(k.memory().used_memory(), 104);
        let free = SyscallParams {
            pointer: addr as u64,
            ..SyscallParams::default()
        };
        assert_eq!(dispatch(&k, Syscall::Free as u64, &free), 0);
        assert_eq!(k.memory().used_memory(), 0);
        assert_eq!(dispatch(&k, Syscall::Malloc as u64, &SyscallParams::args(0, 0)), 0);
    }

    #[test]
    fn stdio_behaviour() {
        let k = kernel();
        assert_eq!(dispatch(&k, Syscall::Read as u64, &SyscallParams::args(STDIN, 10)), 0);
        let mut hello = SyscallParams::with_string("hello\n");
        hello.arg1 = STDOUT;
        assert_eq!(dispatch(&k, Syscall::Write as u64, &hello), 6);
    }

    #[test]
    fn getpid_without_running_process_is_zero() {
        let k = kernel();
        assert_eq!(dispatch(&k, Syscall::GetPid as u64, &SyscallParams::default()), 0);
        assert_eq!(dispatch(&k, Syscall::Exit as u64, &SyscallParams::default()), -1);
    }

    #[test]
    fn close_unknown_descriptor_fails() {
        let k = kernel();
        assert_eq!(dispatch(&k, Syscall::Close as u64, &SyscallParams::args(42, 0)), -1);
        assert_eq!(dispatch(&k, Syscall::Open as u64, &SyscallParams::default()), -1);
    }
}
