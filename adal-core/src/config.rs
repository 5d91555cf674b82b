//! Trainer configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Settings of a [`Trainer`](crate::trainer::Trainer) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Optimization steps performed by `fit`.
    pub max_steps: usize,
    /// Training samples per step.
    pub batch_size: usize,
    /// Samples processed concurrently within a split.
    pub max_concurrency: usize,
    /// Per-sample time limit in milliseconds.
    pub sample_timeout_ms: u64,
    /// Directory for JSON checkpoints; `~` and `$VAR` are expanded.
    pub checkpoint_dir: Option<String>,
    /// Upper bound on few-shot demonstrations per generator.
    pub max_demos: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_steps: 4,
            batch_size: 4,
            max_concurrency: 4,
            sample_timeout_ms: 120_000,
            checkpoint_dir: None,
            max_demos: 4,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `ADAL_*` environment variables; unset or
    /// unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_steps: env_parse("ADAL_MAX_STEPS").unwrap_or(defaults.max_steps),
            batch_size: env_parse("ADAL_BATCH_SIZE").unwrap_or(defaults.batch_size),
            max_concurrency: env_parse("ADAL_MAX_CONCURRENCY").unwrap_or(defaults.max_concurrency),
            sample_timeout_ms: env_parse("ADAL_SAMPLE_TIMEOUT_MS")
                .unwrap_or(defaults.sample_timeout_ms),
            checkpoint_dir: std::env::var("ADAL_CHECKPOINT_DIR").ok(),
            max_demos: env_parse("ADAL_MAX_DEMOS").unwrap_or(defaults.max_demos),
        }
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_sample_timeout_ms(mut self, ms: u64) -> Self {
        self.sample_timeout_ms = ms;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<String>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_max_demos(mut self, n: usize) -> Self {
        self.max_demos = n;
        self
    }

    /// Reject settings that would stall the run.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.sample_timeout_ms == 0 {
            return Err(Error::Config("sample_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Checkpoint directory with `~` and environment variables expanded.
    pub fn checkpoint_path(&self) -> Result<Option<PathBuf>> {
        match &self.checkpoint_dir {
            None => Ok(None),
            Some(dir) => {
                let expanded = shellexpand::full(dir)
                    .map_err(|e| Error::Config(format!("invalid checkpoint_dir '{}': {}", dir, e)))?;
                Ok(Some(PathBuf::from(expanded.into_owned())))
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}
