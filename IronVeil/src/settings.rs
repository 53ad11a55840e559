use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::LevelFilter;
use nexis_sim::{AllocationStrategy, KernelConfig};
use serde::Deserialize;

/// Contents of `config.json`: kernel knobs plus shell-only settings.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(flatten)]
    pub kernel: KernelConfig,
}

/// Overrides given on the command line; these win over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub arena_size: Option<usize>,
    pub tick_ms: Option<u64>,
    pub log_level: Option<String>,
    pub best_fit: bool,
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ironveil").join("config.json"))
}

/// Load `path`, or the per-user default when it exists, or built-in defaults.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(Settings::default()),
        },
    };
    let text = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn parse(text: &str) -> Result<Settings> {
    Ok(serde_json::from_str(text)?)
}

impl Settings {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(size) = overrides.arena_size {
            self.kernel.arena_size = size;
        }
        if let Some(ms) = overrides.tick_ms {
            self.kernel.tick_interval_ms = ms;
        }
        if overrides.log_level.is_some() {
            self.log_level = overrides.log_level;
        }
        if overrides.best_fit {
            self.kernel.strategy = AllocationStrategy::BestFit;
        }
    }

    pub fn level(&self) -> Result<LevelFilter> {
        match self.log_level.as_deref() {
            None => Ok(LevelFilter::Warn),
            Some(name) => name
                .parse()
                .map_err(|_| anyhow!("unknown log level {:?}", name)),
        }
    }
}
