// task.rs

use core::time::Duration;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::KernelConfig;
use crate::process::{Pid, TaskControl};

/// What one call to [`Workload::step`] decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Keep going after pausing this long.
    Continue(Duration),
    Done,
}

/// The work an execution unit performs, one unit at a time.
pub trait Workload: Send + 'static {
    fn step(&mut self, pid: Pid) -> Step;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    Killed,
    Faulted(String),
}

/// Sent by an execution unit right before its thread ends.
#[derive(Clone, Debug)]
pub struct ExitNotice {
    pub pid: Pid,
    pub reason: ExitReason,
}

pub type ExitQueue = Arc<SegQueue<ExitNotice>>;

/// Default workload: random pauses, a log line per unit, and a fixed chance
/// of finishing after each unit.
pub struct SimulatedWork {
    label: &'static str,
    activity: &'static str,
    min_ms: u64,
    max_ms: u64,
    completion_chance: f64,
    units: u64,
    rng: SmallRng,
}

impl SimulatedWork {
    pub fn new(path: &str, config: &KernelConfig) -> Self {
        let (label, activity) = if path.contains("calculator") {
            ("CALC", "performing calculations")
        } else if path.contains("editor") {
            ("EDITOR", "text editing operations")
        } else {
            ("PROC", "process running")
        };
        Self {
            label,
            activity,
            min_ms: config.work_min_ms,
            max_ms: config.work_max_ms,
            completion_chance: config.completion_chance,
            units: 0,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl Workload for SimulatedWork {
    fn step(&mut self, pid: Pid) -> Step {
        if self.units > 0 && self.rng.gen_bool(self.completion_chance) {
            return Step::Done;
        }
        self.units += 1;
        debug!(target: "app", "[{}-{}] {}...", self.label, pid, self.activity);
        Step::Continue(Duration::from_millis(self.rng.gen_range(self.min_ms..=self.max_ms)))
    }
}

/// Sleep for `total`, waking every `poll` to look at the stop flag.
/// Returns false if termination was requested meanwhile.
fn pause(control: &TaskControl, total: Duration, poll: Duration) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if control.termination_requested() {
            return false;
        }
        let slice = left.min(poll);
        thread::sleep(slice);
        left -= slice;
    }
    !control.termination_requested()
}

fn run(pid: Pid, control: &TaskControl, workload: &mut dyn Workload, poll: Duration) -> ExitReason {
    loop {
        while control.is_suspended() {
            if !pause(control, poll, poll) {
                return ExitReason::Killed;
            }
        }
        if control.termination_requested() {
            return ExitReason::Killed;
        }
        match workload.step(pid) {
            Step::Continue(work) => {
                if !pause(control, work, poll) {
                    return ExitReason::Killed;
                }
            }
            Step::Done => return ExitReason::Completed,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown fault".to_string()
    }
}

/// Start the execution unit for `pid` on its own thread.
///
/// A panic inside the workload is caught and reported as
/// [`ExitReason::Faulted`]; either way exactly one notice lands on `exits`.
pub fn spawn(
    pid: Pid,
    control: Arc<TaskControl>,
    mut workload: Box<dyn Workload>,
    poll: Duration,
    exits: ExitQueue,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("proc-{}", pid))
        .spawn(move || {
            info!(target: "process", "executing process {}", pid);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run(pid, &control, workload.as_mut(), poll)
            }));
            let reason = outcome.unwrap_or_else(|payload| ExitReason::Faulted(panic_message(payload)));
            exits.push(ExitNotice { pid, reason });
        })
}
