//! Session Manager for multi-session orchestration
//!
//! Owns the registry of live sessions. Each registered session gets exactly
//! one reaper task that deregisters and releases it once it has been idle
//! longer than its expiry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::driver::DriverFactory;
use super::sandbox::SandboxProvider;
use super::state::Session;
use super::types::{CancelOutcome, SessionConfig, SessionId};

struct ManagerInner {
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    sandbox: Option<Arc<dyn SandboxProvider>>,
}

/// Manages the registry of concurrent sessions
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager whose sessions use `config`
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a manager whose sessions can attach a sandbox from `provider`
    pub fn with_sandbox(config: SessionConfig, provider: Arc<dyn SandboxProvider>) -> Self {
        Self::build(config, Some(provider))
    }

    fn build(config: SessionConfig, sandbox: Option<Arc<dyn SandboxProvider>>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                sandbox,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Look up a session, creating it when `create` is set.
    ///
    /// A new session gets one reaper and, with `driver`, one driver task.
    /// A registered session that already turned inactive is replaced when
    /// `create` is set and returned as-is otherwise. The returned session
    /// is touched, so lookup counts as activity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get_or_create(
        &self,
        session_id: &str,
        create: bool,
        driver: Option<&DriverFactory>,
    ) -> Option<Arc<Session>> {
        let mut sessions = self.inner.sessions.lock();

        if let Some(existing) = sessions.get(session_id) {
            if !create || existing.is_active() {
                let session = Arc::clone(existing);
                drop(sessions);
                session.activate();
                return Some(session);
            }
            debug!(session_id = %session_id, "Replacing inactive session");
        }

        if !create {
            return None;
        }

        let session = Session::build(
            session_id.to_string(),
            self.inner.config.clone(),
            self.inner.sandbox.clone(),
        );
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        drop(sessions);

        self.spawn_reaper(&session);
        if let Some(factory) = driver {
            tokio::spawn(factory(Arc::clone(&session)));
        }
        info!(session_id = %session_id, driver = driver.is_some(), "Session created");
        Some(session)
    }

    /// Look up a registered session without touching it
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(session_id).cloned()
    }

    /// Remove the registry entry. The session's own state is left alone.
    pub fn delete(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.inner.sessions.lock().remove(session_id);
        if removed.is_some() {
            debug!(session_id = %session_id, "Session deregistered");
        }
        removed
    }

    /// A throwaway session with a random id. Never registered and never
    /// reaped; the caller releases it.
    pub fn temporary(&self) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        debug!(session_id = %id, "Temporary session created");
        Session::build(id, self.inner.config.clone(), self.inner.sandbox.clone())
    }

    /// Cancel a request by `(session_id, request_id)`
    pub async fn cancel(&self, session_id: &str, request_id: &str) -> CancelOutcome {
        let Some(session) = self.get(session_id) else {
            return CancelOutcome::SessionNotFound;
        };
        if session.cancel_request(request_id).await {
            info!(session_id = %session_id, request_id = %request_id, "Request canceled");
            CancelOutcome::Canceled
        } else {
            CancelOutcome::RequestNotFound
        }
    }

    /// List registered session ids, sorted
    pub fn list_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.inner.sessions.lock().contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Deactivate and release every registered session
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        info!(count = sessions.len(), "Shutting down sessions");
        for session in sessions {
            session.deactivate();
            session.release().await;
        }
    }

    fn spawn_reaper(&self, session: &Arc<Session>) {
        let manager = Arc::downgrade(&self.inner);
        let session = Arc::clone(session);
        let tick = self.inner.config.reaper_tick;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                if reap(&manager, &session) {
                    break;
                }
            }
            session.release().await;
            debug!(session_id = %session.id(), "Reaper exited");
        });
    }
}

/// One reaper tick. Returns true once the session has been reaped.
///
/// The expiry check and the registry removal happen under the registry
/// lock, and only the entry for this exact session is removed, so a
/// replacement registered under the same id is left alone.
fn reap(manager: &Weak<ManagerInner>, session: &Arc<Session>) -> bool {
    let Some(inner) = manager.upgrade() else {
        session.deactivate();
        return true;
    };

    let mut sessions = inner.sessions.lock();
    if !session.poll_expiry() {
        return false;
    }
    let registered = sessions
        .get(session.id())
        .is_some_and(|s| Arc::ptr_eq(s, session));
    if registered {
        sessions.remove(session.id());
        info!(session_id = %session.id(), "Session expired");
    }
    true
}
