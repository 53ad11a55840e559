// kernel.rs

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::Arc;

use log::{info, warn};
use spin::Mutex;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::fs::FileSystem;
use crate::memory::{MemoryManager, PhysAddr};
use crate::paging::PageMapper;
use crate::pit::Pit;
use crate::process::Pid;
use crate::scheduler::Scheduler;
use crate::syscall::{self, SyscallParams};

/// Owns every subsystem and is the single request surface in front of them.
///
/// Subsystems come up in dependency order (allocator, page mapper, scheduler,
/// filesystem) and go down in reverse. Nothing here is global: callers hold a
/// `Kernel` (or a reference to it) and pass it to whatever needs it.
pub struct Kernel {
    config: KernelConfig,
    memory: Arc<MemoryManager>,
    pager: PageMapper,
    scheduler: Arc<Scheduler>,
    fs: FileSystem,
    pit: Mutex<Option<Pit>>,
    running: AtomicBool,
}

impl Kernel {
    /// Bring up every subsystem. The first failure aborts the boot and nothing
    /// after it is started.
    pub fn boot(config: KernelConfig) -> Result<Self, KernelError> {
        info!(target: "kernel", "booting nexis");
        config.validate()?;

        let memory = Arc::new(MemoryManager::initialize(config.arena_size, config.strategy)?);
        info!(
            target: "kernel",
            "memory manager ready: {} KB arena, {:?}",
            memory.total_memory() / 1024,
            memory.strategy()
        );
        let pager = PageMapper::new(memory.clone());
        info!(target: "kernel", "page mapper ready: {} slots", pager.slots());
        let scheduler = Arc::new(Scheduler::new(memory.clone(), config.clone()));
        let fs = FileSystem::initialize();

        info!(target: "kernel", "all subsystems initialized");
        Ok(Self {
            config,
            memory,
            pager,
            scheduler,
            fs,
            pit: Mutex::new(None),
            running: AtomicBool::new(true),
        })
    }

    /// Start the periodic scheduler tick.
    pub fn start(&self) -> Result<(), KernelError> {
        let mut pit = self.pit.lock();
        if pit.is_some() {
            return Ok(());
        }
        let interval = Duration::from_millis(self.config.tick_interval_ms);
        let timer = Pit::start(self.scheduler.clone(), interval)
            .map_err(|e| KernelError::TimerSpawn(e.to_string()))?;
        *pit = Some(timer);
        info!(target: "kernel", "scheduler tick running every {:?}", interval);
        Ok(())
    }

    /// One manual scheduling round, for callers that run without the tick.
    pub fn tick(&self) {
        self.scheduler.schedule();
    }

    pub fn ticks(&self) -> u64 {
        self.pit.lock().as_ref().map_or(0, Pit::ticks)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the tick, then the scheduler, then the filesystem.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: "kernel", "shutting down");
        let pit = self.pit.lock().take();
        if let Some(mut pit) = pit {
            pit.stop();
        }
        self.scheduler.shutdown();
        self.fs.shutdown();
        if self.memory.used_memory() != 0 {
            warn!(target: "kernel", "{} bytes still allocated at shutdown", self.memory.used_memory());
        }
        info!(target: "kernel", "shutdown complete");
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn pager(&self) -> &PageMapper {
        &self.pager
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn create_process(&self, path: &str) -> Option<Pid> {
        self.scheduler.create_process(path)
    }

    pub fn terminate_process(&self, pid: Pid) -> bool {
        self.scheduler.terminate_process(pid)
    }

    pub fn allocate_memory(&self, size: usize) -> Option<PhysAddr> {
        self.memory.allocate(size)
    }

    pub fn free_memory(&self, addr: PhysAddr) -> bool {
        self.memory.deallocate(addr)
    }

    pub fn create_file(&self, path: &str) -> bool {
        self.fs.create_file(path)
    }

    pub fn delete_file(&self, path: &str) -> bool {
        self.fs.delete_file(path)
    }

    pub fn read_file(&self, path: &str) -> Option<String> {
        self.fs.read_file(path)
    }

    pub fn write_file(&self, path: &str, content: &str) -> bool {
        self.fs.write_file(path, content)
    }

    pub fn system_call(&self, number: u64, params: &SyscallParams) -> i64 {
        syscall::dispatch(self, number, params)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
