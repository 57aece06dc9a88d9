//! Cron scheduler
//!
//! Persisted periodic jobs, each delivered as an ordinary request into the
//! single session [`CRON_SESSION_ID`], so scheduled work is serialized
//! through one queue and never runs concurrently with itself.
//!
//! ```text
//! add_job ──▶ validate ──▶ store ──▶ job task
//!                                       │ sleep(next delay)
//!                                       ▼
//!              SessionManager::get_or_create("cronjob") ──▶ add_request
//!                                       │ wait for terminator (timeout)
//!                                       └─▶ recompute delay from now
//! ```

mod expr;
mod service;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub use expr::{next_run_times, normalize, CronExpr};
pub use service::{CronJobInfo, CronScheduler};
pub use store::{CronJobRecord, JobStore};

/// Session id shared by all cron-triggered work
pub const CRON_SESSION_ID: &str = "cronjob";

/// Runtime cron settings
#[derive(Debug, Clone)]
pub struct CronConfig {
    pub persistence_path: PathBuf,
    /// Maximum wait for a delivered job to finish
    pub response_timeout: Duration,
    /// Floor for the delay between fires
    pub min_delay: Duration,
    pub delivery_retry: RetryPolicy,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            persistence_path: PathBuf::from("./cron_jobs.json"),
            response_timeout: Duration::from_secs(300),
            min_delay: Duration::from_millis(100),
            delivery_retry: RetryPolicy::default(),
        }
    }
}

impl CronConfig {
    pub fn with_persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = path.into();
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}
