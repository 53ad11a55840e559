// process.rs

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Local};

use crate::memory::PhysAddr;

pub type Pid = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcState::Ready => "READY",
            ProcState::Running => "RUNNING",
            ProcState::Blocked => "BLOCKED",
            ProcState::Terminated => "TERMINATED",
        })
    }
}

/// Flags shared between a PCR and its execution unit. The unit only reads
/// them; the scheduler is the only writer.
#[derive(Debug, Default)]
pub struct TaskControl {
    terminate: AtomicBool,
    suspended: AtomicBool,
}

impl TaskControl {
    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// Process control record.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub state: ProcState,
    pub path: String,
    pub memory_base: Option<PhysAddr>,
    pub memory_size: usize,
    pub environment: BTreeMap<String, String>,
    pub priority: i32,
    pub cpu_time: Duration,
    pub start_time: DateTime<Local>,
    pub(crate) control: Arc<TaskControl>,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl Process {
    pub fn new(pid: Pid, parent: Pid, path: &str, priority: i32) -> Self {
        let environment = [("PATH", "/bin:/usr/bin"), ("HOME", "/home/user"), ("USER", "user")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            pid,
            parent,
            state: ProcState::Ready,
            path: path.to_string(),
            memory_base: None,
            memory_size: 0,
            environment,
            priority,
            cpu_time: Duration::ZERO,
            start_time: Local::now(),
            control: Arc::new(TaskControl::default()),
            handle: None,
        }
    }

    pub fn termination_requested(&self) -> bool {
        self.control.termination_requested()
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent: self.parent,
            state: self.state,
            path: self.path.clone(),
            memory_base: self.memory_base,
            memory_size: self.memory_size,
            environment: self.environment.clone(),
            priority: self.priority,
            cpu_time: self.cpu_time,
            start_time: self.start_time,
            termination_requested: self.termination_requested(),
        }
    }
}

/// Point-in-time copy of a [`Process`], safe to hand out of the table lock.
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent: Pid,
    pub state: ProcState,
    pub path: String,
    pub memory_base: Option<PhysAddr>,
    pub memory_size: usize,
    pub environment: BTreeMap<String, String>,
    pub priority: i32,
    pub cpu_time: Duration,
    pub start_time: DateTime<Local>,
    pub termination_requested: bool,
}

/// Live PCRs in creation order, plus the scheduler's notion of "current".
#[derive(Default)]
pub struct ProcessTable {
    procs: Vec<Process>,
    pub current: Option<Pid>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, process: Process) {
        self.procs.push(process);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let idx = self.procs.iter().position(|p| p.pid == pid)?;
        if self.current == Some(pid) {
            self.current = None;
        }
        Some(self.procs.remove(idx))
    }

    pub fn find(&self, pid: Pid) -> Option<&Process> {
        self.procs.iter().find(|p| p.pid == pid)
    }

    pub fn find_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.iter_mut().find(|p| p.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.procs.iter()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.iter().map(|p| p.pid).collect()
    }

    /// Highest-priority READY process. Linear scan in table order, so the
    /// earliest pid wins a tie.
    pub fn select_next(&self) -> Option<Pid> {
        let mut best: Option<&Process> = None;
        for p in self.procs.iter().filter(|p| p.state == ProcState::Ready) {
            if best.map_or(true, |b| p.priority > b.priority) {
                best = Some(p);
            }
        }
        best.map(|p| p.pid)
    }

    /// Mark `next` RUNNING and demote whatever ran before it to READY.
    pub fn context_switch(&mut self, next: Pid) {
        if let Some(old) = self.current.take() {
            if let Some(p) = self.find_mut(old) {
                if p.state == ProcState::Running {
                    p.state = ProcState::Ready;
                }
            }
        }
        if let Some(p) = self.find_mut(next) {
            p.state = ProcState::Running;
            self.current = Some(next);
        }
    }
}
