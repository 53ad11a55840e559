// scheduler.rs

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use log::{debug, info, trace, warn};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::memory::MemoryManager;
use crate::process::{Pid, ProcState, Process, ProcessInfo, ProcessTable};
use crate::task::{self, ExitQueue, ExitReason, SimulatedWork, Workload};

pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGKILL: i32 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Stop,
    Continue,
    Other(i32),
}

impl From<i32> for Signal {
    fn from(n: i32) -> Self {
        match n {
            SIGKILL => Signal::Kill,
            SIGSTOP => Signal::Stop,
            SIGCONT => Signal::Continue,
            other => Signal::Other(other),
        }
    }
}

struct Table {
    procs: ProcessTable,
    last_dispatch: Instant,
}

/// Owns every PCR and decides which one is "current".
///
/// The table lock is never held while calling into the allocator or while
/// joining an execution unit.
pub struct Scheduler {
    memory: Arc<MemoryManager>,
    config: KernelConfig,
    table: Mutex<Table>,
    next_pid: AtomicU32,
    exits: ExitQueue,
    running: AtomicBool,
}

impl Scheduler {
    pub fn new(memory: Arc<MemoryManager>, config: KernelConfig) -> Self {
        info!(target: "scheduler", "process manager initialized");
        Self {
            memory,
            config,
            table: Mutex::new(Table {
                procs: ProcessTable::new(),
                last_dispatch: Instant::now(),
            }),
            next_pid: AtomicU32::new(1),
            exits: Arc::new(SegQueue::new()),
            running: AtomicBool::new(true),
        }
    }

    fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Create a process running the default simulated workload.
    pub fn create_process(&self, path: &str) -> Option<Pid> {
        let workload = SimulatedWork::new(path, &self.config);
        self.spawn_process(path, Box::new(workload))
    }

    /// Create a process whose execution unit runs `workload`.
    pub fn spawn_process(&self, path: &str, workload: Box<dyn Workload>) -> Option<Pid> {
        if path.trim().is_empty() {
            warn!(target: "scheduler", "refusing to create a process with an empty path");
            return None;
        }
        if !self.running.load(Ordering::SeqCst) {
            warn!(target: "scheduler", "scheduler is shut down, not creating {}", path);
            return None;
        }

        let pid = self.alloc_pid();
        let quota = self.config.process_quota;
        let base = match self.memory.allocate_for_process(pid, quota) {
            Some(base) => base,
            None => {
                warn!(target: "scheduler", "failed to allocate memory for {} ({})", pid, path);
                return None;
            }
        };

        let parent = self.table.lock().procs.current.unwrap_or(0);
        let mut pcr = Process::new(pid, parent, path, self.config.default_priority);
        pcr.memory_base = Some(base);
        pcr.memory_size = quota;

        // The unit idles until its PCR is in the table, so its exit notice can
        // never arrive before there is something to reap.
        pcr.control.set_suspended(true);
        match task::spawn(pid, pcr.control.clone(), workload, self.poll_interval(), self.exits.clone()) {
            Ok(handle) => pcr.handle = Some(handle),
            Err(e) => {
                warn!(target: "scheduler", "failed to start process {}: {}", pid, e);
                self.memory.deallocate_process_memory(pid);
                return None;
            }
        }
        let control = pcr.control.clone();
        let mut table = self.table.lock();
        table.procs.insert(pcr);
        control.set_suspended(false);
        drop(table);

        info!(target: "scheduler", "created process {} ({}), {}KB at {}", pid, path, quota / 1024, base);
        Some(pid)
    }

    /// Release the memory of a stopped process and drop its PCR.
    fn reap(&self, pid: Pid) {
        self.memory.deallocate_process_memory(pid);
        self.table.lock().procs.remove(pid);
    }

    /// Wait for the unit of `pid` to stop and release the process.
    ///
    /// Only the caller holding the join handle reaps. Everybody else waits for
    /// that reap to land, so no caller returns while the unit still runs.
    fn finish(&self, pid: Pid, handle: Option<JoinHandle<()>>) {
        match handle {
            Some(handle) => {
                Self::join(pid, handle);
                self.reap(pid);
            }
            None => {
                while self.table.lock().procs.find(pid).is_some() {
                    thread::sleep(self.poll_interval());
                }
            }
        }
    }

    fn join(pid: Pid, handle: JoinHandle<()>) {
        if handle.join().is_err() {
            warn!(target: "scheduler", "execution unit of process {} panicked outside its workload", pid);
        }
    }

    pub fn terminate_process(&self, pid: Pid) -> bool {
        let handle = {
            let mut table = self.table.lock();
            let pcr = match table.procs.find_mut(pid) {
                Some(pcr) => pcr,
                None => {
                    warn!(target: "scheduler", "process {} not found", pid);
                    return false;
                }
            };
            pcr.control.request_termination();
            pcr.state = ProcState::Terminated;
            let handle = pcr.handle.take();
            if table.procs.current == Some(pid) {
                table.procs.current = None;
            }
            handle
        };
        self.finish(pid, handle);
        info!(target: "scheduler", "terminated process {}", pid);
        true
    }

    pub fn suspend_process(&self, pid: Pid) -> bool {
        let mut table = self.table.lock();
        let pcr = match table.procs.find_mut(pid) {
            Some(pcr) if matches!(pcr.state, ProcState::Ready | ProcState::Running) => pcr,
            _ => return false,
        };
        pcr.state = ProcState::Blocked;
        pcr.control.set_suspended(true);
        if table.procs.current == Some(pid) {
            table.procs.current = None;
        }
        debug!(target: "scheduler", "suspended process {}", pid);
        true
    }

    pub fn resume_process(&self, pid: Pid) -> bool {
        let mut table = self.table.lock();
        match table.procs.find_mut(pid) {
            Some(pcr) if pcr.state == ProcState::Blocked => {
                pcr.state = ProcState::Ready;
                pcr.control.set_suspended(false);
                debug!(target: "scheduler", "resumed process {}", pid);
                true
            }
            _ => false,
        }
    }

    /// Drain exit notices and reap every process whose unit has stopped.
    fn reap_exited(&self) {
        while let Some(notice) = self.exits.pop() {
            let pid = notice.pid;
            let handle = {
                let mut table = self.table.lock();
                match table.procs.find_mut(pid) {
                    Some(pcr) => {
                        pcr.state = ProcState::Terminated;
                        let handle = pcr.handle.take();
                        if table.procs.current == Some(pid) {
                            table.procs.current = None;
                        }
                        handle
                    }
                    // Already reaped by whoever asked it to stop.
                    None => continue,
                }
            };
            match &notice.reason {
                ExitReason::Completed => info!(target: "scheduler", "process {} completed execution", pid),
                ExitReason::Killed => debug!(target: "scheduler", "process {} stopped", pid),
                ExitReason::Faulted(why) => warn!(target: "scheduler", "process {} faulted: {}", pid, why),
            }
            // Without the handle another caller is joining and will reap.
            if let Some(handle) = handle {
                Self::join(pid, handle);
                self.reap(pid);
            }
        }
    }

    /// One scheduling tick.
    pub fn schedule(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.reap_exited();

        let mut table = self.table.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(table.last_dispatch);
        table.last_dispatch = now;
        if let Some(cur) = table.procs.current {
            if let Some(pcr) = table.procs.find_mut(cur) {
                if pcr.state == ProcState::Running {
                    pcr.cpu_time += elapsed;
                }
            }
        }

        if let Some(next) = table.procs.select_next() {
            if table.procs.current != Some(next) {
                trace!(target: "scheduler", "context switch {:?} -> {}", table.procs.current, next);
                table.procs.context_switch(next);
            }
        }
    }

    pub fn set_process_priority(&self, pid: Pid, priority: i32) -> bool {
        let mut table = self.table.lock();
        match table.procs.find_mut(pid) {
            Some(pcr) => {
                pcr.priority = priority;
                debug!(target: "scheduler", "set priority {} for process {}", priority, pid);
                true
            }
            None => false,
        }
    }

    pub fn send_signal(&self, pid: Pid, signal: i32) -> bool {
        if self.table.lock().procs.find(pid).is_none() {
            warn!(target: "scheduler", "signal {} to unknown process {}", signal, pid);
            return false;
        }
        debug!(target: "scheduler", "sending signal {} to process {}", signal, pid);
        match Signal::from(signal) {
            Signal::Kill => self.terminate_process(pid),
            Signal::Stop => self.suspend_process(pid),
            Signal::Continue => self.resume_process(pid),
            Signal::Other(_) => true,
        }
    }

    /// Block until the execution unit of `pid` has stopped, then reap it.
    pub fn wait_for_process(&self, pid: Pid) -> bool {
        let handle = match self.table.lock().procs.find_mut(pid) {
            Some(pcr) => pcr.handle.take(),
            None => return false,
        };
        self.finish(pid, handle);
        true
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.table.lock().procs.current
    }

    pub fn process(&self, pid: Pid) -> Option<ProcessInfo> {
        self.table.lock().procs.find(pid).map(Process::info)
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.table.lock().procs.iter().map(Process::info).collect()
    }

    pub fn process_count(&self) -> usize {
        self.table.lock().procs.len()
    }

    /// Stop accepting work and terminate every live process.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let pids = self.table.lock().procs.pids();
        for pid in pids {
            self.terminate_process(pid);
        }
        while self.exits.pop().is_some() {}
        info!(target: "scheduler", "process manager shutdown complete");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocationStrategy;

    fn scheduler(arena: usize) -> Scheduler {
        let memory = Arc::new(MemoryManager::initialize(arena, AllocationStrategy::FirstFit).unwrap());
        Scheduler::new(memory, KernelConfig::quick())
    }

    #[test]
    fn signal_numbers() {
        assert_eq!(Signal::from(9), Signal::Kill);
        assert_eq!(Signal::from(19), Signal::Stop);
        assert_eq!(Signal::from(18), Signal::Continue);
        assert_eq!(Signal::from(15), Signal::Other(15));
    }

    #[test]
    fn empty_path_is_rejected_without_using_a_pid() {
        let s = scheduler(1024 * 1024);
        assert_eq!(s.create_process("  "), None);
        assert_eq!(s.create_process("a"), Some(1));
    }

    #[test]
    fn illegal_transitions_have_no_effect() {
        let s = scheduler(1024 * 1024);
        let pid = s.create_process("a").unwrap();
        assert!(!s.resume_process(pid));
        assert!(s.suspend_process(pid));
        assert!(!s.suspend_process(pid));
        assert!(s.resume_process(pid));
        assert_eq!(s.process(pid).unwrap().state, ProcState::Ready);
        assert!(!s.suspend_process(99));
    }

    #[test]
    fn schedule_charges_cpu_time_to_running_process() {
        let s = scheduler(1024 * 1024);
        let pid = s.create_process("a").unwrap();
        s.schedule();
        thread::sleep(Duration::from_millis(5));
        s.schedule();
        let info = s.process(pid).unwrap();
        assert_eq!(info.state, ProcState::Running);
        assert!(info.cpu_time >= Duration::from_millis(5));
    }

    #[test]
    fn shutdown_releases_everything() {
        let s = scheduler(1024 * 1024);
        s.create_process("a").unwrap();
        s.create_process("b").unwrap();
        s.shutdown();
        assert_eq!(s.process_count(), 0);
        assert_eq!(s.memory.used_memory(), 0);
        assert_eq!(s.create_process("c"), None);
    }
}
