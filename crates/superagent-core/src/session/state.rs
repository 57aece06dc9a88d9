//! Session state machine and request queue

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::Resources;
use super::request::{Request, ResponseStream};
use super::sandbox::SandboxProvider;
use super::types::{RequestId, RequestPayload, SessionConfig, SessionId, SessionStatus, Termination};
use crate::error::{ConnectionError, Error, Result};

/// Queue, pending table and status. Never held across an await.
struct QueueState {
    status: SessionStatus,
    last_activity: Instant,
    pending: HashMap<RequestId, Arc<Request>>,
    queue: VecDeque<Arc<Request>>,
}

/// A single addressable unit of serialized work and its stateful resources
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    state: Mutex<QueueState>,
    arrivals: Notify,
    /// Serializes connection acquisition and teardown
    pub(super) resources: tokio::sync::Mutex<Resources>,
    released: AtomicBool,
    sandbox: Option<Arc<dyn SandboxProvider>>,
}

impl Session {
    /// Create a standalone session
    pub fn new(id: impl Into<SessionId>, config: SessionConfig) -> Arc<Self> {
        Self::build(id.into(), config, None)
    }

    pub(crate) fn build(
        id: SessionId,
        config: SessionConfig,
        sandbox: Option<Arc<dyn SandboxProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            created_at: Utc::now(),
            state: Mutex::new(QueueState {
                status: SessionStatus::Active,
                last_activity: Instant::now(),
                pending: HashMap::new(),
                queue: VecDeque::new(),
            }),
            arrivals: Notify::new(),
            resources: tokio::sync::Mutex::new(Resources::default()),
            released: AtomicBool::new(false),
            sandbox,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Time since the last liveness touch
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_activity.elapsed()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn has_pending(&self, request_id: &str) -> bool {
        self.state.lock().pending.contains_key(request_id)
    }

    /// Touch `last_activity`. An inactive session stays inactive.
    pub fn activate(&self) {
        let mut state = self.state.lock();
        if state.status == SessionStatus::Active {
            state.last_activity = Instant::now();
        }
    }

    /// Queue a request.
    ///
    /// On an inactive session the request is rejected on the spot: its
    /// stream gets the terminator and `false` is returned.
    pub fn add_request(&self, request: Arc<Request>) -> bool {
        let mut state = self.state.lock();
        if state.status == SessionStatus::Inactive {
            drop(state);
            debug!(session_id = %self.id, request_id = %request.id(), "Rejecting request on inactive session");
            request.terminate(Termination::Rejected);
            return false;
        }

        state.last_activity = Instant::now();
        state
            .pending
            .insert(request.id().to_string(), Arc::clone(&request));
        state.queue.push_back(request);
        drop(state);

        self.arrivals.notify_one();
        true
    }

    /// Create a request for `payload` and queue it
    pub fn submit(&self, payload: RequestPayload) -> (Arc<Request>, ResponseStream) {
        let (request, stream) = Request::new(self.id.clone(), payload);
        self.add_request(Arc::clone(&request));
        (request, stream)
    }

    /// Wait for the next request.
    ///
    /// Re-checks idleness every `idle_poll`; once `expiry` has passed with no
    /// activity the session turns inactive and `(None, Inactive)` is returned
    /// without consuming anything.
    pub async fn get_request(&self) -> (Option<Arc<Request>>, SessionStatus) {
        loop {
            {
                let mut state = self.state.lock();
                if state.status == SessionStatus::Inactive {
                    return (None, SessionStatus::Inactive);
                }
                if let Some(request) = state.queue.pop_front() {
                    return (Some(request), SessionStatus::Active);
                }
                if state.last_activity.elapsed() > self.config.expiry {
                    self.expire_locked(&mut state);
                    return (None, SessionStatus::Inactive);
                }
            }
            // A notify_one with no waiter leaves a permit, so arrivals between
            // the check above and this wait are not lost
            let _ = tokio::time::timeout(self.config.idle_poll, self.arrivals.notified()).await;
        }
    }

    /// Remove a request from the pending table. Idempotent.
    pub fn finish_request(&self, request: &Request) {
        if self.state.lock().pending.remove(request.id()).is_some() {
            debug!(session_id = %self.id, request_id = %request.id(), "Request finished");
        }
    }

    /// Cancel a pending request. Returns false if it was unknown or already
    /// finished.
    pub async fn cancel_request(&self, request_id: &str) -> bool {
        let request = {
            let mut state = self.state.lock();
            let Some(request) = state.pending.get(request_id).cloned() else {
                return false;
            };
            // Still queued: it will never reach a driver, so it is finished now
            if let Some(pos) = state.queue.iter().position(|r| r.id() == request_id) {
                state.queue.remove(pos);
                state.pending.remove(request_id);
            }
            request
        };
        request.cancel().await;
        true
    }

    /// Idleness check shared by the reaper and `get_request`.
    ///
    /// Returns true if the session is inactive, performing the transition
    /// if the expiry has just passed.
    pub fn poll_expiry(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            SessionStatus::Inactive => true,
            SessionStatus::Active if state.last_activity.elapsed() > self.config.expiry => {
                self.expire_locked(&mut state);
                true
            }
            SessionStatus::Active => false,
        }
    }

    /// Turn inactive now, regardless of idleness. Used on shutdown.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        if state.status == SessionStatus::Active {
            self.expire_locked(&mut state);
        }
    }

    fn expire_locked(&self, state: &mut QueueState) {
        state.status = SessionStatus::Inactive;
        let rejected = state.queue.len();
        for request in state.queue.drain(..) {
            state.pending.remove(request.id());
            request.terminate(Termination::Rejected);
        }
        info!(session_id = %self.id, rejected, "Session inactive");
        // Wake every waiting consumer so each sees the new status
        self.arrivals.notify_waiters();
    }

    /// Provision the session's sandbox. Connects at most once.
    pub async fn attach_sandbox(&self) -> Result<()> {
        let Some(provider) = &self.sandbox else {
            return Err(Error::Config("no sandbox provider configured".to_string()));
        };
        self.activate();

        let mut resources = self.resources.lock().await;
        if self.is_released() {
            return Err(Error::SessionInactive(self.id.clone()));
        }
        if resources.sandbox_attached {
            return Ok(());
        }
        provider
            .connect(&self.id)
            .await
            .map_err(|e| ConnectionError::ConnectFailed {
                name: "sandbox".to_string(),
                reason: format!("{:#}", e),
            })?;
        resources.sandbox_attached = true;
        info!(session_id = %self.id, "Sandbox attached");
        Ok(())
    }

    pub async fn has_sandbox(&self) -> bool {
        self.resources.lock().await.sandbox_attached
    }

    /// Signal close on every connection and release the sandbox.
    ///
    /// Only the first call does anything. Does not wait for connections to
    /// finish disconnecting.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut resources = self.resources.lock().await;
        let closed = resources.connections.len();
        for (_, entry) in resources.connections.drain() {
            entry.close();
        }

        if resources.sandbox_attached {
            resources.sandbox_attached = false;
            if let Some(provider) = &self.sandbox {
                if let Err(e) = provider.release(&self.id).await {
                    warn!(session_id = %self.id, error = %e, "Sandbox release failed");
                }
            }
        }
        info!(session_id = %self.id, connections = closed, "Session released");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ResponseFrame;

    fn config(expiry_secs: u64) -> SessionConfig {
        SessionConfig::default().with_expiry(Duration::from_secs(expiry_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_request_detects_expiry() {
        let session = Session::new("idle", config(5));
        let start = Instant::now();

        let (request, status) = session.get_request().await;
        assert!(request.is_none());
        assert_eq!(status, SessionStatus::Inactive);
        // Detected within one poll tick after the expiry
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() <= Duration::from_secs(7));

        session.activate();
        assert_eq!(session.status(), SessionStatus::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_request_wakes_on_arrival() {
        let session = Session::new("busy", config(600));
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.get_request().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (submitted, _stream) = session.submit(RequestPayload::text("hi"));

        let (request, status) = waiter.await.unwrap();
        assert_eq!(status, SessionStatus::Active);
        assert_eq!(request.unwrap().id(), submitted.id());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let session = Session::new("fifo", config(600));
        let ids: Vec<String> = (0..5)
            .map(|i| session.submit(RequestPayload::text(format!("r{}", i))).0.id().to_string())
            .collect();

        for id in ids {
            let (request, _) = session.get_request().await;
            assert_eq!(request.unwrap().id(), id);
        }
    }

    #[tokio::test]
    async fn test_rejected_after_inactive() {
        let session = Session::new("dead", config(600));
        session.deactivate();

        let (request, mut stream) = Request::new("dead", RequestPayload::text("late"));
        assert!(!session.add_request(Arc::clone(&request)));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(
            stream.recv().await,
            Some(ResponseFrame::End(Termination::Rejected))
        );
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_drains_queue() {
        let session = Session::new("stale", config(1));
        let (_, stream) = session.submit(RequestPayload::text("queued"));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(session.poll_expiry());
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.queue_len(), 0);
        assert_eq!(stream.collect().await.1, Termination::Rejected);
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let session = Session::new("cancel", config(600));
        let (request, stream) = session.submit(RequestPayload::text("x"));

        assert!(session.cancel_request(request.id()).await);
        assert!(!session.cancel_request(request.id()).await);
        assert_eq!(session.queue_len(), 0);
        assert!(!session.has_pending(request.id()));
        assert_eq!(stream.collect().await.1, Termination::Canceled);
    }

    #[tokio::test]
    async fn test_finish_request_idempotent() {
        let session = Session::new("finish", config(600));
        let (request, _stream) = session.submit(RequestPayload::text("x"));
        let (dequeued, _) = session.get_request().await;
        let dequeued = dequeued.unwrap();

        session.finish_request(&dequeued);
        session.finish_request(&dequeued);
        assert!(!session.has_pending(request.id()));
        assert!(!session.cancel_request(request.id()).await);
    }

    #[tokio::test]
    async fn test_sandbox_requires_provider() {
        let session = Session::new("nosandbox", config(600));
        assert!(matches!(
            session.attach_sandbox().await,
            Err(Error::Config(_))
        ));
    }
}
