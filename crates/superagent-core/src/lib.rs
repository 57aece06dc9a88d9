//! Superagent Core - concurrency backbone for a multi-tenant agent backend
//!
//! This crate provides:
//! - Session registry with per-session expiry and reaping
//! - Per-session FIFO request queues with cancellation
//! - Stateful connections owned by dedicated tasks
//! - Persisted cron jobs delivered through the `cronjob` session

pub mod config;
pub mod error;
#[cfg(feature = "mcp")]
pub mod mcp_connector;
pub mod retry;
pub mod scheduler;
pub mod session;

pub use config::{Config, ConfigManager, ConnectionConfig, CronSettings, SessionSettings, TransportKind};
pub use error::{ConnectionError, Error, Result};
pub use retry::RetryPolicy;

#[cfg(feature = "mcp")]
pub use mcp_connector::{McpConnection, McpConnector, McpToolInfo};

// Scheduler exports
pub use scheduler::{CronConfig, CronJobInfo, CronJobRecord, CronScheduler, JobStore, CRON_SESSION_ID};

// Session exports
pub use session::{
    drive_session, handler_driver, CancelOutcome, Connection, Connector, ContentBlock,
    DriverFactory, Request, RequestHandler, RequestId, RequestPayload, ResponseFrame,
    ResponseStream, SandboxProvider, Session, SessionConfig, SessionId, SessionManager,
    SessionStatus, Termination,
};
