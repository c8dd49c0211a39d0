use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Default number of parallel workers.
pub const DEFAULT_MAX_WORKERS: usize = 4;
/// Default FAILED_ITEM ratio above which the quality gate terminates a run.
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.5;
/// Default score spread tolerated between agents before a divergence is raised.
pub const DEFAULT_TOLERANCE: f64 = 0.3;
/// Default number of debate rounds per divergence case.
pub const DEFAULT_MAX_ROUNDS: u32 = 2;
/// Default number of repair attempts for malformed output.
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u32 = 3;
/// Default timeout for one external call (2 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub service: ServiceConfig,
    pub extraction: ExtractionConfig,
    pub quality: QualityConfig,
    pub divergence: DivergenceConfig,
    pub debate: DebateConfig,
    pub budget: BudgetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Retry parameters for transient external-service failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Executable invoked for each external analysis call.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("sift-agent")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_repair_attempts: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_QUALITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceConfig {
    pub default_tolerance: f64,
    /// Per-dimension overrides.
    pub tolerances: BTreeMap<String, f64>,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            default_tolerance: DEFAULT_TOLERANCE,
            tolerances: BTreeMap::new(),
        }
    }
}

impl DivergenceConfig {
    pub fn tolerance_for(&self, dimension: &str) -> f64 {
        self.tolerances
            .get(dimension)
            .copied()
            .unwrap_or(self.default_tolerance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    pub max_rounds: u32,
    /// Lead the best defense needs over the runner-up to win outright.
    pub margin: f64,
    /// Minimum absolute score for a defense to win.
    pub min_score: f64,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            margin: 0.15,
            min_score: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BudgetConfig {
    /// Cap on external calls issued by one process run. `None` means unlimited.
    pub max_external_calls: Option<u64>,
}

impl Config {
    pub fn sift_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".sift"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::sift_dir()?.join("sift.toml"))
    }

    pub fn default_state_dir() -> Result<PathBuf> {
        Ok(Self::sift_dir()?.join("state"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.pool.max_workers,
            threshold = config.quality.threshold,
            max_rounds = config.debate.max_rounds,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_workers == 0 {
            return Err(Error::Validation("pool.max_workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.quality.threshold) {
            return Err(Error::Validation(format!(
                "quality.threshold must be within [0, 1], got {}",
                self.quality.threshold
            )));
        }
        if self.divergence.default_tolerance < 0.0
            || self.divergence.tolerances.values().any(|t| *t < 0.0)
        {
            return Err(Error::Validation("divergence tolerances must be non-negative".into()));
        }
        if self.debate.max_rounds == 0 {
            return Err(Error::Validation("debate.max_rounds must be at least 1".into()));
        }
        Ok(())
    }
}
