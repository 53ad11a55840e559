// config.rs

use serde::Deserialize;

use crate::error::KernelError;
use crate::memory::PAGE_SIZE;

/// 16 MiB arena, same as the pool the boot path used to carve out.
pub const DEFAULT_ARENA_SIZE: usize = 16 * 1024 * 1024;
/// Memory handed to every process at creation.
pub const DEFAULT_PROCESS_QUOTA: usize = 64 * 1024;

/// Block selection policy used by [`crate::memory::MemoryManager::allocate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    FirstFit,
    BestFit,
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        AllocationStrategy::FirstFit
    }
}

/// Knobs for the whole simulated kernel.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub arena_size: usize,
    pub strategy: AllocationStrategy,
    pub process_quota: usize,
    pub default_priority: i32,
    pub tick_interval_ms: u64,
    /// Lower bound of one simulated unit of work.
    pub work_min_ms: u64,
    /// Upper bound of one simulated unit of work.
    pub work_max_ms: u64,
    /// Chance that a process finishes on its own after a unit of work.
    pub completion_chance: f64,
    /// How often a sleeping execution unit checks its stop flag.
    pub poll_interval_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            strategy: AllocationStrategy::FirstFit,
            process_quota: DEFAULT_PROCESS_QUOTA,
            default_priority: 1,
            tick_interval_ms: 10,
            work_min_ms: 1000,
            work_max_ms: 5000,
            completion_chance: 0.125,
            poll_interval_ms: 10,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.arena_size == 0 || self.arena_size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidCapacity(self.arena_size));
        }
        if self.process_quota == 0 {
            return Err(KernelError::InvalidConfig("process_quota must be non-zero"));
        }
        if self.work_min_ms > self.work_max_ms {
            return Err(KernelError::InvalidConfig("work_min_ms exceeds work_max_ms"));
        }
        if !(0.0..=1.0).contains(&self.completion_chance) {
            return Err(KernelError::InvalidConfig("completion_chance must be within [0, 1]"));
        }
        if self.tick_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(KernelError::InvalidConfig("tick and poll intervals must be non-zero"));
        }
        Ok(())
    }

    /// Short pauses and no natural exits: processes live until killed.
    pub fn quick() -> Self {
        Self {
            arena_size: 1024 * 1024,
            work_min_ms: 1,
            work_max_ms: 3,
            completion_chance: 0.0,
            poll_interval_ms: 1,
            tick_interval_ms: 2,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(KernelConfig::default().validate().is_ok());
        assert!(KernelConfig::quick().validate().is_ok());
    }

    #[test]
    fn rejects_unaligned_arena() {
        let cfg = KernelConfig {
            arena_size: PAGE_SIZE + 1,
            ..KernelConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(KernelError::InvalidCapacity(_))));
    }

    #[test]
    fn rejects_inverted_work_range() {
        let cfg = KernelConfig {
            work_min_ms: 10,
            work_max_ms: 5,
            ..KernelConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(KernelError::InvalidConfig(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: KernelConfig =
            serde_json::from_str(r#"{ "arena_size": 65536, "strategy": "best_fit" }"#).unwrap();
        assert_eq!(cfg.arena_size, 65536);
        assert_eq!(cfg.strategy, AllocationStrategy::BestFit);
        assert_eq!(cfg.process_quota, DEFAULT_PROCESS_QUOTA);
    }
}
