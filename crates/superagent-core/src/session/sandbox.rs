//! Per-session sandbox resource

use async_trait::async_trait;

/// Provisions an isolated execution environment for a session.
///
/// A session connects at most once and releases when the session is released.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn connect(&self, session_id: &str) -> anyhow::Result<()>;

    async fn release(&self, session_id: &str) -> anyhow::Result<()>;
}
