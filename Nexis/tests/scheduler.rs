use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nexis_sim::scheduler::{SIGCONT, SIGKILL, SIGSTOP};
use nexis_sim::task::{Step, Workload};
use nexis_sim::{AllocationStrategy, KernelConfig, MemoryManager, Pid, ProcState, Scheduler};

fn scheduler_with(arena: usize) -> (Arc<MemoryManager>, Scheduler) {
    let memory = Arc::new(MemoryManager::initialize(arena, AllocationStrategy::FirstFit).unwrap());
    let scheduler = Scheduler::new(memory.clone(), KernelConfig::quick());
    (memory, scheduler)
}

fn running(s: &Scheduler) -> Vec<Pid> {
    s.processes()
        .into_iter()
        .filter(|p| p.state == ProcState::Running)
        .map(|p| p.pid)
        .collect()
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

struct Crash;

impl Workload for Crash {
    fn step(&mut self, _pid: Pid) -> Step {
        panic!("segmentation fault");
    }
}

struct Brief(u32);

impl Workload for Brief {
    fn step(&mut self, _pid: Pid) -> Step {
        match self.0 {
            0 => Step::Done,
            _ => {
                self.0 -= 1;
                Step::Continue(Duration::from_millis(1))
            }
        }
    }
}

/// Each step blocks for a while; flags `stopped` once the unit lets go of it.
struct Slow {
    stopped: Arc<AtomicBool>,
}

impl Workload for Slow {
    fn step(&mut self, _pid: Pid) -> Step {
        thread::sleep(Duration::from_millis(300));
        Step::Continue(Duration::from_millis(1))
    }
}

impl Drop for Slow {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn slow_process(s: &Scheduler) -> (Pid, Arc<AtomicBool>) {
    let stopped = Arc::new(AtomicBool::new(false));
    let pid = s
        .spawn_process("slow", Box::new(Slow { stopped: stopped.clone() }))
        .unwrap();
    (pid, stopped)
}

#[test]
fn pids_are_never_reused() {
    let (_, s) = scheduler_with(1024 * 1024);
    assert_eq!(s.create_process("a"), Some(1));
    assert_eq!(s.create_process("b"), Some(2));
    assert!(s.terminate_process(1));
    assert_eq!(s.create_process("c"), Some(3));
    s.shutdown();
}

#[test]
fn higher_priority_runs_first() {
    let (_, s) = scheduler_with(1024 * 1024);
    let low = s.create_process("low").unwrap();
    let high = s.create_process("high").unwrap();
    assert!(s.set_process_priority(low, 5));
    assert!(s.set_process_priority(high, 10));
    s.schedule();
    assert_eq!(running(&s), vec![high]);
    assert_eq!(s.current_pid(), Some(high));
    assert_eq!(s.process(low).unwrap().state, ProcState::Ready);
    s.shutdown();
}

#[test]
fn at_most_one_running_after_every_tick() {
    let (_, s) = scheduler_with(1024 * 1024);
    let mut seen = BTreeSet::new();
    for i in 0..6 {
        let pid = s.create_process(&format!("/bin/p{}", i)).unwrap();
        assert!(seen.insert(pid));
        s.set_process_priority(pid, i % 3);
    }
    for round in 0..30 {
        if round == 10 {
            s.suspend_process(3);
        }
        if round == 20 {
            s.send_signal(2, SIGKILL);
        }
        s.schedule();
        assert!(running(&s).len() <= 1);
    }
    s.shutdown();
}

#[test]
fn creation_fails_when_arena_is_exhausted() {
    // Two 64 KiB quotas fit in 128 KiB, a third does not.
    let (memory, s) = scheduler_with(128 * 1024);
    assert!(s.create_process("a").is_some());
    assert!(s.create_process("b").is_some());
    assert_eq!(s.create_process("c"), None);
    assert_eq!(s.process_count(), 2);
    assert_eq!(memory.free_memory(), 0);
    s.terminate_process(1);
    assert_eq!(memory.free_memory(), 64 * 1024);
    s.shutdown();
}

#[test]
fn faulting_process_is_reaped() {
    let (memory, s) = scheduler_with(1024 * 1024);
    let pid = s.spawn_process("/bin/crash", Box::new(Crash)).unwrap();
    assert!(wait_until(|| {
        s.schedule();
        s.process(pid).is_none()
    }));
    assert_eq!(memory.used_memory(), 0);
}

#[test]
fn finished_process_is_reaped() {
    let (memory, s) = scheduler_with(1024 * 1024);
    let pid = s.spawn_process("/bin/brief", Box::new(Brief(3))).unwrap();
    assert!(s.wait_for_process(pid));
    assert!(s.process(pid).is_none());
    assert_eq!(memory.used_memory(), 0);
    assert!(!s.wait_for_process(pid));
}

#[test]
fn stop_and_continue_signals() {
    let (_, s) = scheduler_with(1024 * 1024);
    let pid = s.create_process("a").unwrap();
    s.schedule();
    assert!(s.send_signal(pid, SIGSTOP));
    assert_eq!(s.process(pid).unwrap().state, ProcState::Blocked);
    assert_eq!(s.current_pid(), None);
    s.schedule();
    assert!(running(&s).is_empty());
    assert!(s.send_signal(pid, SIGCONT));
    s.schedule();
    assert_eq!(running(&s), vec![pid]);
    assert!(!s.send_signal(99, SIGKILL));
    s.shutdown();
}

#[test]
fn new_process_metadata() {
    let (_, s) = scheduler_with(1024 * 1024);
    let first = s.create_process("/bin/calculator").unwrap();
    s.schedule();
    let child = s.create_process("/bin/editor").unwrap();
    let info = s.process(child).unwrap();
    assert_eq!(info.parent, first);
    assert_eq!(info.path, "/bin/editor");
    assert_eq!(info.memory_size, 64 * 1024);
    assert!(info.memory_base.is_some());
    assert_eq!(info.environment.get("HOME").map(String::as_str), Some("/home/user"));
    assert_eq!(s.process(first).unwrap().parent, 0);
    s.shutdown();
}

#[test]
fn terminate_during_wait_returns_after_the_unit_stops() {
    let (memory, s) = scheduler_with(1024 * 1024);
    let s = Arc::new(s);
    let (pid, stopped) = slow_process(&s);
    s.schedule();
    thread::sleep(Duration::from_millis(20));

    let waiter = {
        let s = s.clone();
        thread::spawn(move || s.wait_for_process(pid))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(s.terminate_process(pid));
    assert!(stopped.load(Ordering::SeqCst));
    assert!(s.process(pid).is_none());
    assert_eq!(memory.used_memory(), 0);
    assert!(waiter.join().unwrap());
    s.shutdown();
}

#[test]
fn concurrent_terminates_both_wait_for_the_unit() {
    let (memory, s) = scheduler_with(1024 * 1024);
    let s = Arc::new(s);
    let (pid, stopped) = slow_process(&s);
    s.schedule();
    thread::sleep(Duration::from_millis(20));

    let first = {
        let s = s.clone();
        thread::spawn(move || s.terminate_process(pid))
    };
    thread::sleep(Duration::from_millis(30));
    let second = s.terminate_process(pid);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(s.process(pid).is_none());
    assert_eq!(memory.used_memory(), 0);
    let first = first.join().unwrap();
    assert!(first || second);
    s.shutdown();
}
