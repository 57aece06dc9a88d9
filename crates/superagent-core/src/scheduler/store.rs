//! Cron job persistence
//!
//! All jobs live in one JSON file: `{"jobs": [{"id", "cron_expr", "task_description"}]}`.
//! Only the static definitions are stored; fire times are recomputed on load.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;

/// Persisted definition of a cron job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobRecord {
    pub id: String,
    pub cron_expr: String,
    pub task_description: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<CronJobRecord>,
}

/// The on-disk job file
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored job.
    ///
    /// A missing, unreadable or malformed file yields no jobs.
    pub fn load(&self) -> Vec<CronJobRecord> {
        if !self.path.exists() {
            return Vec::new();
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read cron jobs");
                return Vec::new();
            }
        };
        match serde_json::from_str::<JobFile>(&content) {
            Ok(file) => {
                debug!(path = %self.path.display(), count = file.jobs.len(), "Loaded cron jobs");
                file.jobs
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse cron jobs");
                Vec::new()
            }
        }
    }

    /// Replace the stored job set
    ///
    /// Writes a fresh temp file beside the target and renames it over, so
    /// readers never see a partial file.
    pub fn save(&self, jobs: &[CronJobRecord]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let file = JobFile {
            jobs: jobs.to_vec(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Insert or replace a job by id, then save
    pub fn upsert(&self, record: CronJobRecord) -> Result<()> {
        let mut jobs = self.load();
        match jobs.iter_mut().find(|j| j.id == record.id) {
            Some(existing) => *existing = record,
            None => jobs.push(record),
        }
        self.save(&jobs)
    }

    /// Remove a job by id. Returns false if it was not stored.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut jobs = self.load();
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.save(&jobs)?;
        Ok(true)
    }
}
