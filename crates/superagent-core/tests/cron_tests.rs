//! Cron scheduler integration tests
//!
//! Tests for the scheduler including:
//! - Validation before anything is stored
//! - Persistence across scheduler instances
//! - Delivery into the shared cron session
//! - Failing and hanging runs not stopping a schedule

use async_trait::async_trait;
use chrono::{Local, Timelike};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use superagent_core::error::Error;
use superagent_core::scheduler::{CronConfig, CronJobRecord, CronScheduler, JobStore, CRON_SESSION_ID};
use superagent_core::session::{
    handler_driver, Request, RequestHandler, Session, SessionConfig, SessionManager,
};
use tempfile::TempDir;

fn cron_config(dir: &TempDir) -> CronConfig {
    CronConfig::default().with_persistence_path(dir.path().join("cron_jobs.json"))
}

fn scheduler(dir: &TempDir) -> CronScheduler {
    CronScheduler::new(SessionManager::new(SessionConfig::default()), cron_config(dir), None)
}

#[derive(Default)]
struct Recorder {
    tasks: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RequestHandler for Recorder {
    async fn handle(&self, session: Arc<Session>, request: Arc<Request>) -> anyhow::Result<()> {
        self.tasks
            .lock()
            .push((session.id().to_string(), request.payload().text_content()));
        request.send_chunk("done");
        Ok(())
    }
}

/// Counts runs and behaves badly on every one
struct Misbehaves {
    runs: AtomicUsize,
    hang: bool,
}

#[async_trait]
impl RequestHandler for Misbehaves {
    async fn handle(&self, _session: Arc<Session>, _request: Arc<Request>) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        anyhow::bail!("tool crashed")
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

mod job_management_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_expression_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let err = scheduler.add_job("61 * * * *", "never", None).unwrap_err();
        assert!(matches!(err, Error::InvalidCron { .. }));
        assert!(scheduler.add_job("@sometimes", "never", None).is_err());
        assert!(scheduler.add_job("* * *", "never", None).is_err());

        assert_eq!(scheduler.job_count(), 0);
        assert!(scheduler.store().load().is_empty());
    }

    #[tokio::test]
    async fn test_add_list_delete() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let generated = scheduler.add_job("*/5 * * * *", "ping", None).unwrap();
        assert!(!generated.is_empty());
        scheduler
            .add_job("@daily", "report", Some("daily-report".to_string()))
            .unwrap();

        let jobs = scheduler.list_jobs();
        assert_eq!(jobs.len(), 2);
        let daily = jobs.iter().find(|j| j.id == "daily-report").unwrap();
        assert_eq!(daily.task_description, "report");
        assert!(daily.running);
        assert!(daily.next_run.is_some());

        assert!(scheduler.delete_job("daily-report"));
        assert!(!scheduler.delete_job("daily-report"));
        let stored: Vec<_> = scheduler.store().load().into_iter().map(|r| r.id).collect();
        assert_eq!(stored, vec![generated]);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_id_replaces_job() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        scheduler.add_job("@hourly", "old", Some("job".to_string())).unwrap();
        scheduler.add_job("@daily", "new", Some("job".to_string())).unwrap();

        let jobs = scheduler.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_description, "new");
        assert_eq!(scheduler.store().load().len(), 1);
        scheduler.shutdown().await;
    }

    #[test]
    fn test_next_run_times() {
        let times = CronScheduler::next_run_times("@hourly", 3).unwrap();
        assert_eq!(times.len(), 3);
        for time in times.iter().map(|t| t.with_timezone(&Local)) {
            assert_eq!((time.minute(), time.second()), (0, 0));
        }
        assert!(CronScheduler::next_run_times("not cron", 3).is_err());
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_jobs_survive_restart() {
        let dir = TempDir::new().unwrap();
        let first = scheduler(&dir);
        first.add_job("0 9 * * 1-5", "standup", Some("a".to_string())).unwrap();
        first.add_job("*/10 * * * * *", "poll", Some("b".to_string())).unwrap();
        let before = first.store().load();
        first.shutdown().await;

        let second = scheduler(&dir);
        assert_eq!(second.load_from_disk(), 2);
        let after: Vec<_> = second
            .list_jobs()
            .into_iter()
            .map(|j| CronJobRecord {
                id: j.id,
                cron_expr: j.cron_expr,
                task_description: j.task_description,
            })
            .collect();
        assert_eq!(after, before);
        assert!(second.list_jobs().iter().all(|j| j.next_run.is_some()));
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_stored_job_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("cron_jobs.json"));
        store
            .save(&[
                CronJobRecord {
                    id: "good".to_string(),
                    cron_expr: "@weekly".to_string(),
                    task_description: "cleanup".to_string(),
                },
                CronJobRecord {
                    id: "bad".to_string(),
                    cron_expr: "every tuesday".to_string(),
                    task_description: "broken".to_string(),
                },
            ])
            .unwrap();

        let scheduler = scheduler(&dir);
        assert_eq!(scheduler.load_from_disk(), 1);
        assert_eq!(scheduler.list_jobs()[0].id, "good");
        // Loading does not rewrite the file
        assert_eq!(scheduler.store().load().len(), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_all_persisted() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        let adds: Vec<_> = (0..16)
            .map(|i| {
                let scheduler = scheduler.clone();
                tokio::task::spawn_blocking(move || {
                    scheduler.add_job("@hourly", "x", Some(format!("job{}", i)))
                })
            })
            .collect();
        for add in adds {
            add.await.unwrap().unwrap();
        }

        assert_eq!(scheduler.job_count(), 16);
        let stored = scheduler.store().load();
        assert_eq!(stored.len(), 16);
        assert!(stored.windows(2).all(|w| w[0].id < w[1].id));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreadable_store_means_no_jobs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("cron_jobs.json"), "[[[").unwrap();
        let scheduler = scheduler(&dir);
        assert_eq!(scheduler.load_from_disk(), 0);
    }
}

mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_job_delivered_into_cron_session() {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::new(SessionConfig::default());
        let recorder = Arc::new(Recorder::default());
        let driver = handler_driver(Arc::clone(&recorder));
        let scheduler = CronScheduler::new(sessions.clone(), cron_config(&dir), Some(driver));

        scheduler.add_job("* * * * * *", "check inbox", None).unwrap();
        assert!(wait_until(|| recorder.tasks.lock().len() >= 2, Duration::from_secs(5)).await);

        for (session_id, task) in recorder.tasks.lock().iter() {
            assert_eq!(session_id, CRON_SESSION_ID);
            assert_eq!(task, "check inbox");
        }
        assert!(sessions.has_session(CRON_SESSION_ID));

        scheduler.shutdown().await;
        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_runs_keep_schedule() {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::new(SessionConfig::default());
        let handler = Arc::new(Misbehaves {
            runs: AtomicUsize::new(0),
            hang: false,
        });
        let driver = handler_driver(Arc::clone(&handler));
        let scheduler = CronScheduler::new(sessions.clone(), cron_config(&dir), Some(driver));

        scheduler.add_job("* * * * * *", "flaky", None).unwrap();
        assert!(wait_until(|| handler.runs.load(Ordering::SeqCst) >= 2, Duration::from_secs(5)).await);
        assert!(scheduler.list_jobs()[0].running);

        scheduler.shutdown().await;
        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_hanging_run_is_canceled_after_timeout() {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::new(SessionConfig::default());
        let handler = Arc::new(Misbehaves {
            runs: AtomicUsize::new(0),
            hang: true,
        });
        let driver = handler_driver(Arc::clone(&handler));
        let config = cron_config(&dir).with_response_timeout(Duration::from_millis(300));
        let scheduler = CronScheduler::new(sessions.clone(), config, Some(driver));

        scheduler.add_job("* * * * * *", "stuck", None).unwrap();
        // A second run can only start once the first was canceled
        assert!(wait_until(|| handler.runs.load(Ordering::SeqCst) >= 2, Duration::from_secs(5)).await);

        let session = sessions.get(CRON_SESSION_ID).unwrap();
        assert!(session.pending_count() <= 1);

        scheduler.shutdown().await;
        sessions.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_job_stops_firing() {
        let dir = TempDir::new().unwrap();
        let sessions = SessionManager::new(SessionConfig::default());
        let recorder = Arc::new(Recorder::default());
        let driver = handler_driver(Arc::clone(&recorder));
        let scheduler = CronScheduler::new(sessions.clone(), cron_config(&dir), Some(driver));

        let id = scheduler.add_job("* * * * * *", "tick", None).unwrap();
        assert!(wait_until(|| !recorder.tasks.lock().is_empty(), Duration::from_secs(5)).await);
        assert!(scheduler.delete_job(&id));

        // Let any in-flight delivery settle, then make sure nothing new arrives
        tokio::time::sleep(Duration::from_millis(300)).await;
        let settled = recorder.tasks.lock().len();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(recorder.tasks.lock().len(), settled);

        sessions.shutdown().await;
    }
}
