//! Session types
//!
//! These types define the protocol between callers submitting work, the
//! session that queues it, and the driver that produces the streamed output.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Unique identifier for a session
pub type SessionId = String;

/// Unique identifier for a request
pub type RequestId = String;

/// Session lifecycle state. `Active -> Inactive` happens once and never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Inactive,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// One piece of request content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { url: String },
}

/// What a caller submits into a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub content: Vec<ContentBlock>,
    /// Extended-reasoning mode
    #[serde(default)]
    pub deep_research: bool,
}

impl RequestPayload {
    /// Create a payload with a single text block
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            deep_research: false,
        }
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.content.push(ContentBlock::Image { url: url.into() });
        self
    }

    pub fn with_deep_research(mut self, enabled: bool) -> Self {
        self.deep_research = enabled;
        self
    }

    /// All text blocks joined by newlines
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How a request's response stream ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum Termination {
    /// The handler finished normally
    Completed,
    /// The session was inactive; the request never ran
    Rejected,
    /// The request was canceled
    Canceled,
    /// The handler failed or panicked
    Failed(String),
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Completed)
    }
}

/// One frame on a request's response channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResponseFrame {
    Chunk(String),
    /// Terminator. Exactly one is sent per request.
    End(Termination),
}

impl ResponseFrame {
    pub fn is_end(&self) -> bool {
        matches!(self, ResponseFrame::End(_))
    }
}

/// Result of cancelling a request by `(session_id, request_id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Canceled,
    SessionNotFound,
    /// Unknown or already finished
    RequestNotFound,
}

/// Runtime session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which the session becomes inactive
    pub expiry: Duration,
    /// Wait slice of `get_request` between expiry checks
    pub idle_poll: Duration,
    /// Reaper tick
    pub reaper_tick: Duration,
    /// Upper bound on a single connection acquisition
    pub acquire_timeout: Duration,
    pub connect_retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(600),
            idle_poll: Duration::from_secs(1),
            reaper_tick: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(60),
            connect_retry: RetryPolicy::once(),
        }
    }
}

impl SessionConfig {
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn with_reaper_tick(mut self, reaper_tick: Duration) -> Self {
        self.reaper_tick = reaper_tick;
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    pub fn with_connect_retry(mut self, connect_retry: RetryPolicy) -> Self {
        self.connect_retry = connect_retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_text_content_skips_images() {
        let payload = RequestPayload::text("first")
            .with_image("https://example.com/a.png")
            .with_deep_research(true);
        assert_eq!(payload.text_content(), "first");
        assert!(payload.deep_research);
        assert_eq!(payload.content.len(), 2);
    }

    #[test]
    fn test_content_block_wire_format() {
        let json = serde_json::to_value(ContentBlock::Text {
            text: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hi"}));
    }

    #[test]
    fn test_frame_wire_format() {
        let end = serde_json::to_value(ResponseFrame::End(Termination::Failed("x".into()))).unwrap();
        assert_eq!(end["type"], "end");
        assert_eq!(end["data"]["type"], "failed");
        assert_eq!(end["data"]["message"], "x");
    }
}
