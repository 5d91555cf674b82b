//! JSON checkpoints of training progress.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::report::{StepRecord, TrainReport};
use crate::error::Result;

const REPORT_FILE: &str = "train_report.json";

/// Writes step records and the final report into a directory.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
}

impl CheckpointWriter {
    /// Create the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_step(&self, record: &StepRecord) -> Result<PathBuf> {
        let path = self.dir.join(format!("step_{:04}.json", record.step));
        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        debug!(path = %path.display(), "wrote step checkpoint");
        Ok(path)
    }

    pub fn write_report(&self, report: &TrainReport) -> Result<PathBuf> {
        let path = self.dir.join(REPORT_FILE);
        fs::write(&path, serde_json::to_string_pretty(report)?)?;
        debug!(path = %path.display(), "wrote train report");
        Ok(path)
    }

    pub fn load_report(&self) -> Result<TrainReport> {
        let raw = fs::read_to_string(self.dir.join(REPORT_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
