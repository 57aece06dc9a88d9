//! Demo request handler for `superagent serve`
//!
//! Stands in for the reasoning engine: opens the configured connections on
//! the request's session, reports what they offer, then streams the request
//! text back word by word.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use superagent_core::config::ConnectionConfig;
use superagent_core::session::{Request, RequestHandler, Session};

const WORD_DELAY: Duration = Duration::from_millis(150);

pub struct EchoHandler {
    connections: Vec<(String, ConnectionConfig)>,
}

impl EchoHandler {
    pub fn new(connections: Vec<(String, ConnectionConfig)>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, session: Arc<Session>, request: Arc<Request>) -> anyhow::Result<()> {
        for (name, config) in &self.connections {
            match session.acquire_configured(name, config).await {
                Some(connection) => {
                    let tools: Vec<_> = connection.tools().iter().map(|t| t.name.as_str()).collect();
                    request.send_chunk(format!("[{}: {}] ", name, tools.join(", ")));
                }
                None => {
                    request.send_chunk(format!("[{}: unavailable] ", name));
                }
            }
        }

        let text = request.payload().text_content();
        if text.trim().is_empty() {
            anyhow::bail!("nothing to echo");
        }

        for word in text.split_whitespace() {
            // Long-running work keeps the session alive
            session.activate();
            if !request.send_chunk(format!("{} ", word)) {
                debug!(request_id = %request.id(), "Listener went away");
                break;
            }
            tokio::time::sleep(WORD_DELAY).await;
        }
        Ok(())
    }
}
