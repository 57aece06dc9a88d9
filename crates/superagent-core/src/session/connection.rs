//! Stateful connections owned by a dedicated task
//!
//! Some connections keep context-bound state, so connect and disconnect must
//! run on the same task. For each named connection one owner task:
//!
//! ```text
//! acquire ──spawn──► owner task
//!    │                 connect()
//!    ◄──── oneshot ─── handle
//!                      wait for close signal
//!                      close()
//! ```
//!
//! Callers only ever see the handle; teardown is fire-and-forget.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::Session;
use crate::error::{ConnectionError, Error, Result};

/// A live stateful connection
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Cheap liveness check run before a cached connection is reused
    async fn health_check(&self) -> anyhow::Result<()>;

    /// Disconnect. Always called from the owner task that connected.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Knows how to establish one kind of [`Connection`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> anyhow::Result<Self::Connection>;
}

/// A cached connection and the means to shut its owner task down
pub(super) struct ConnectionEntry {
    connection: Arc<dyn Connection>,
    typed: Arc<dyn Any + Send + Sync>,
    close_tx: Option<oneshot::Sender<()>>,
    owner: JoinHandle<()>,
}

impl ConnectionEntry {
    /// Raise the close signal. Does not wait for the disconnect.
    pub(super) fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }

    pub(super) fn is_owner_alive(&self) -> bool {
        !self.owner.is_finished()
    }
}

/// Resources guarded by the session's acquisition lock
#[derive(Default)]
pub(super) struct Resources {
    pub(super) connections: HashMap<String, ConnectionEntry>,
    pub(super) sandbox_attached: bool,
}

fn spawn_owner<C: Connector>(
    session_id: String,
    name: String,
    connector: Arc<C>,
    mut handoff: oneshot::Sender<std::result::Result<Arc<C::Connection>, String>>,
    close_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let connected = tokio::select! {
            result = connector.connect() => result,
            _ = handoff.closed() => {
                debug!(session_id = %session_id, connection = %name, "Acquirer gave up before connect finished");
                return;
            }
        };

        let connection = match connected {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                let _ = handoff.send(Err(format!("{:#}", e)));
                return;
            }
        };

        if handoff.send(Ok(Arc::clone(&connection))).is_err() {
            // Nobody will ever close it otherwise
            if let Err(e) = connection.close().await {
                warn!(session_id = %session_id, connection = %name, error = %e, "Close after abandoned handoff failed");
            }
            return;
        }

        // A dropped sender counts as a close signal too
        let _ = close_rx.await;
        match connection.close().await {
            Ok(()) => debug!(session_id = %session_id, connection = %name, "Connection closed"),
            Err(e) => warn!(session_id = %session_id, connection = %name, error = %e, "Connection close failed"),
        }
    })
}

/// Liveness of a cached connection: owner task still running and the check
/// answering within `timeout`
async fn check_health(
    name: &str,
    connection: &dyn Connection,
    owner_alive: bool,
    timeout: Duration,
) -> std::result::Result<(), ConnectionError> {
    let unhealthy = |reason: String| ConnectionError::Unhealthy {
        name: name.to_string(),
        reason,
    };
    if !owner_alive {
        return Err(unhealthy("owner task exited".to_string()));
    }
    match tokio::time::timeout(timeout, connection.health_check()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(unhealthy(format!("{:#}", e))),
        Err(_) => Err(unhealthy(format!("no answer within {}s", timeout.as_secs()))),
    }
}

impl Session {
    /// Acquire the named connection, connecting on first use.
    ///
    /// Returns `None` when the connection cannot be established; the reason
    /// is logged. See [`Session::try_acquire`] for the error.
    pub async fn acquire<C: Connector>(&self, name: &str, connector: C) -> Option<Arc<C::Connection>> {
        match self.try_acquire(name, connector).await {
            Ok(connection) => Some(connection),
            Err(e) => {
                warn!(session_id = %self.id(), connection = %name, error = %e, "Connection unavailable");
                None
            }
        }
    }

    /// Acquire the named connection.
    ///
    /// A cached connection is health-checked and reused; an unhealthy one is
    /// closed, evicted and replaced. Acquisitions are serialized per session,
    /// so concurrent callers for the same name share one connect attempt.
    pub async fn try_acquire<C: Connector>(&self, name: &str, connector: C) -> Result<Arc<C::Connection>> {
        if self.is_released() {
            return Err(Error::SessionInactive(self.id().to_string()));
        }
        self.activate();

        let mut resources = self.resources.lock().await;
        // Released while we waited for the lock
        if self.is_released() {
            return Err(Error::SessionInactive(self.id().to_string()));
        }

        if let Some(entry) = resources.connections.get(name) {
            let checked = check_health(
                name,
                entry.connection.as_ref(),
                entry.is_owner_alive(),
                self.config().acquire_timeout,
            )
            .await;
            let healthy = match checked {
                Ok(()) => true,
                Err(e) => {
                    warn!(session_id = %self.id(), error = %e, "Evicting connection");
                    false
                }
            };

            if healthy {
                debug!(session_id = %self.id(), connection = %name, "Reusing connection");
                return Arc::clone(&entry.typed)
                    .downcast::<C::Connection>()
                    .map_err(|_| {
                        Error::from(ConnectionError::TypeMismatch {
                            name: name.to_string(),
                            expected: std::any::type_name::<C::Connection>(),
                        })
                    });
            }

            if let Some(entry) = resources.connections.remove(name) {
                entry.close();
            }
        }

        let connector = Arc::new(connector);
        let (connection, entry) = self
            .config()
            .connect_retry
            .run(|attempt| self.connect_once(name, Arc::clone(&connector), attempt))
            .await?;

        resources.connections.insert(name.to_string(), entry);
        info!(session_id = %self.id(), connection = %name, "Connection established");
        Ok(connection)
    }

    async fn connect_once<C: Connector>(
        &self,
        name: &str,
        connector: Arc<C>,
        attempt: u32,
    ) -> std::result::Result<(Arc<C::Connection>, ConnectionEntry), ConnectionError> {
        debug!(session_id = %self.id(), connection = %name, attempt, "Connecting");
        let (handoff_tx, handoff_rx) = oneshot::channel();
        let (close_tx, close_rx) = oneshot::channel();
        let owner = spawn_owner(
            self.id().to_string(),
            name.to_string(),
            connector,
            handoff_tx,
            close_rx,
        );

        let timeout = self.config().acquire_timeout;
        let connection = match tokio::time::timeout(timeout, handoff_rx).await {
            Ok(Ok(Ok(connection))) => connection,
            Ok(Ok(Err(reason))) => {
                return Err(ConnectionError::ConnectFailed {
                    name: name.to_string(),
                    reason,
                });
            }
            // The owner task died without reporting, e.g. a panic in connect
            Ok(Err(_)) => return Err(ConnectionError::OwnerGone(name.to_string())),
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    name: name.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };

        let entry = ConnectionEntry {
            connection: Arc::clone(&connection) as Arc<dyn Connection>,
            typed: Arc::clone(&connection) as Arc<dyn Any + Send + Sync>,
            close_tx: Some(close_tx),
            owner,
        };
        Ok((connection, entry))
    }

    /// Signal the named connection to close. Returns false if there was none.
    pub async fn release_connection(&self, name: &str) -> bool {
        let entry = self.resources.lock().await.connections.remove(name);
        match entry {
            Some(entry) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    /// Names of the currently cached connections, sorted
    pub async fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.resources.lock().await.connections.keys().cloned().collect();
        names.sort();
        names
    }
}
