// pit.rs

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::scheduler::Scheduler;

/// Periodic timer driving [`Scheduler::schedule`] from its own thread.
pub struct Pit {
    ticks: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Pit {
    pub fn start(scheduler: Arc<Scheduler>, interval: Duration) -> io::Result<Self> {
        let ticks = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let ticks = ticks.clone();
            let stop = stop.clone();
            thread::Builder::new().name("pit".into()).spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    scheduler.schedule();
                    ticks.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(interval);
                }
            })?
        };
        debug!(target: "kernel", "scheduler tick started every {:?}", interval);
        Ok(Self {
            ticks,
            stop,
            handle: Some(handle),
        })
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "kernel", "scheduler tick thread panicked");
            }
        }
    }
}

impl Drop for Pit {
    fn drop(&mut self) {
        self.stop();
    }
}
