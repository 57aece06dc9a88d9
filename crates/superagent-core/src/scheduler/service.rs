//! Cron scheduler service
//!
//! Each job runs in its own task: sleep until the next fire time, deliver
//! the job into the cron session as an ordinary request, wait for its
//! response to finish, recompute the delay from the current time, repeat.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::expr::{self, CronExpr};
use super::store::{CronJobRecord, JobStore};
use super::{CronConfig, CRON_SESSION_ID};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::session::{
    DriverFactory, Request, RequestPayload, ResponseStream, Session, SessionManager, Termination,
};

/// A job as reported by [`CronScheduler::list_jobs`]
#[derive(Debug, Clone, Serialize)]
pub struct CronJobInfo {
    pub id: String,
    pub cron_expr: String,
    pub task_description: String,
    /// Whether the scheduling task is still alive
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
}

struct ScheduledJob {
    record: CronJobRecord,
    expr: CronExpr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a job task needs to deliver one fire
#[derive(Clone)]
struct Delivery {
    sessions: SessionManager,
    driver: Option<DriverFactory>,
    response_timeout: Duration,
    retry: RetryPolicy,
}

struct SchedulerInner {
    delivery: Delivery,
    min_delay: Duration,
    store: JobStore,
    jobs: Mutex<HashMap<String, ScheduledJob>>,
    /// Held from snapshot to rename so saves land in snapshot order
    persist_lock: Mutex<()>,
}

/// Runs persisted periodic jobs through the fixed cron session
///
/// Cheap to clone; clones share the same job table.
#[derive(Clone)]
pub struct CronScheduler {
    inner: Arc<SchedulerInner>,
}

impl CronScheduler {
    /// Create a scheduler delivering into `sessions`.
    ///
    /// With `driver`, the cron session is started with it when first created.
    pub fn new(sessions: SessionManager, config: CronConfig, driver: Option<DriverFactory>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                delivery: Delivery {
                    sessions,
                    driver,
                    response_timeout: config.response_timeout,
                    retry: config.delivery_retry,
                },
                min_delay: config.min_delay,
                store: JobStore::new(config.persistence_path),
                jobs: Mutex::new(HashMap::new()),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Start every stored job. Returns how many were scheduled; invalid
    /// entries are logged and skipped.
    pub fn load_from_disk(&self) -> usize {
        let records = self.inner.store.load();
        let mut scheduled = 0;
        for record in records {
            let id = record.id.clone();
            match self.schedule(record) {
                Ok(_) => scheduled += 1,
                Err(e) => warn!(job_id = %id, error = %e, "Skipping stored cron job"),
            }
        }
        info!(count = scheduled, "Restored cron jobs");
        scheduled
    }

    /// Validate, store and start a job. Returns its id.
    ///
    /// An existing job with the same id is replaced.
    pub fn add_job(&self, cron_expr: &str, task_description: &str, id: Option<String>) -> Result<String> {
        let record = CronJobRecord {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            cron_expr: cron_expr.trim().to_string(),
            task_description: task_description.to_string(),
        };
        let id = self.schedule(record)?;
        self.persist();
        info!(job_id = %id, cron_expr = %cron_expr, "Cron job added");
        Ok(id)
    }

    /// Stop and remove a job. Returns false if it was unknown.
    pub fn delete_job(&self, id: &str) -> bool {
        let Some(job) = self.inner.jobs.lock().remove(id) else {
            return false;
        };
        job.cancel.cancel();
        self.persist();
        info!(job_id = %id, "Cron job deleted");
        true
    }

    /// All jobs, sorted by id
    pub fn list_jobs(&self) -> Vec<CronJobInfo> {
        let now = Utc::now();
        let mut jobs: Vec<_> = self
            .inner
            .jobs
            .lock()
            .values()
            .map(|job| CronJobInfo {
                id: job.record.id.clone(),
                cron_expr: job.record.cron_expr.clone(),
                task_description: job.record.task_description.clone(),
                running: !job.handle.is_finished(),
                next_run: job.expr.next_after(now),
            })
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    /// The next `count` fire times of `cron_expr`
    pub fn next_run_times(cron_expr: &str, count: usize) -> Result<Vec<DateTime<Utc>>> {
        expr::next_run_times(cron_expr, count)
    }

    /// Stop every job loop. The store is left as is.
    pub async fn shutdown(&self) {
        let jobs: Vec<_> = self.inner.jobs.lock().drain().map(|(_, job)| job).collect();
        for job in &jobs {
            job.cancel.cancel();
        }
        for job in jobs {
            let _ = job.handle.await;
        }
        debug!("Cron scheduler stopped");
    }

    fn schedule(&self, record: CronJobRecord) -> Result<String> {
        let expr = CronExpr::parse(&record.cron_expr)?;
        let initial = expr.next_delay(Utc::now(), self.inner.min_delay)?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_job(
            self.inner.delivery.clone(),
            record.clone(),
            expr.clone(),
            initial,
            self.inner.min_delay,
            cancel.clone(),
        ));

        let id = record.id.clone();
        debug!(job_id = %id, initial_delay_ms = initial.as_millis() as u64, "Cron job scheduled");
        let previous = self.inner.jobs.lock().insert(
            id.clone(),
            ScheduledJob {
                record,
                expr,
                cancel,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(id)
    }

    fn persist(&self) {
        let _guard = self.inner.persist_lock.lock();
        let mut records: Vec<_> = self
            .inner
            .jobs
            .lock()
            .values()
            .map(|job| job.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        if let Err(e) = self.inner.store.save(&records) {
            warn!(path = %self.inner.store.path().display(), error = %e, "Failed to persist cron jobs");
        }
    }
}

async fn run_job(
    delivery: Delivery,
    record: CronJobRecord,
    expr: CronExpr,
    initial: Duration,
    min_delay: Duration,
    cancel: CancellationToken,
) {
    let mut delay = initial;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match delivery.execute(&record, &cancel).await {
            Ok(Termination::Completed) => debug!(job_id = %record.id, "Cron job run completed"),
            Ok(termination) => warn!(job_id = %record.id, ?termination, "Cron job run did not complete"),
            Err(Error::Cancelled) => break,
            Err(e) => warn!(job_id = %record.id, error = %e, "Cron job run failed"),
        }
        if cancel.is_cancelled() {
            break;
        }

        delay = match expr.next_delay(Utc::now(), min_delay) {
            Ok(delay) => delay,
            Err(e) => {
                error!(job_id = %record.id, error = %e, "Cron job stopped");
                break;
            }
        };
    }
    debug!(job_id = %record.id, "Cron job loop exited");
}

impl Delivery {
    /// Deliver one fire into the cron session and wait for it to finish
    async fn execute(&self, record: &CronJobRecord, cancel: &CancellationToken) -> Result<Termination> {
        // Deleting the job also abandons any backoff between attempts
        let (session, request, stream) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            submitted = self.retry.run(|attempt| async move { self.submit(record, attempt) }) => submitted?,
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            collected = tokio::time::timeout(self.response_timeout, stream.collect()) => Some(collected),
        };

        match outcome {
            Some(Ok((chunks, termination))) => {
                debug!(job_id = %record.id, chunks = chunks.len(), "Cron response drained");
                Ok(termination)
            }
            Some(Err(_)) => {
                session.cancel_request(request.id()).await;
                Err(Error::Timeout(self.response_timeout.as_secs()))
            }
            None => {
                session.cancel_request(request.id()).await;
                Err(Error::Cancelled)
            }
        }
    }

    /// One delivery attempt; a fresh request each time
    fn submit(
        &self,
        record: &CronJobRecord,
        attempt: u32,
    ) -> Result<(Arc<Session>, Arc<Request>, ResponseStream)> {
        let session = self
            .sessions
            .get_or_create(CRON_SESSION_ID, true, self.driver.as_ref())
            .ok_or_else(|| Error::SessionUnavailable(CRON_SESSION_ID.to_string()))?;

        let (request, stream) = Request::new(
            CRON_SESSION_ID,
            RequestPayload::text(record.task_description.clone()),
        );
        if !session.add_request(Arc::clone(&request)) {
            return Err(Error::SessionInactive(CRON_SESSION_ID.to_string()));
        }
        debug!(job_id = %record.id, request_id = %request.id(), attempt, "Cron job delivered");
        Ok((session, request, stream))
    }
}
