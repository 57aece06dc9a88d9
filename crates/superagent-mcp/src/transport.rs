//! MCP Transport layer implementations

use async_trait::async_trait;
use futures::StreamExt;
use eventsource_stream::Eventsource;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

/// Header carrying the server-assigned session for streamable HTTP
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, message: Value) -> io::Result<()>;
    async fn receive(&mut self) -> io::Result<Option<Value>>;
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        (**self).send(message).await
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        (**self).receive().await
    }

    async fn close(&mut self) -> io::Result<()> {
        (**self).close().await
    }
}

/// Stdio transport for subprocess communication
pub struct StdioTransport {
    child: Child,
    reader: Option<BufReader<tokio::process::ChildStdout>>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> io::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdout"))?;

        Ok(Self {
            child,
            reader: Some(BufReader::new(stdout)),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::other("Stdin not available"))?;

        let json = serde_json::to_string(&message)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;

        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| io::Error::other("Reader not available"))?;

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;

            if n == 0 {
                return Ok(None);
            }
            // Servers may emit blank keep-alive lines
            if line.trim().is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(&line)?;
            return Ok(Some(value));
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        // Closing stdin lets well-behaved servers exit on their own
        drop(self.child.stdin.take());
        self.reader = None;
        self.child.kill().await?;
        Ok(())
    }
}

/// Streamable HTTP transport.
///
/// Every client message is POSTed to a single endpoint. The server replies
/// either with a JSON body or with an SSE stream of messages; both are
/// buffered and handed out by `receive`. The session id assigned by the
/// server on `initialize` is echoed on every later request, which is what
/// makes the connection stateful.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    session_id: Option<String>,
    inbox: VecDeque<Value>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            headers,
            session_id: None,
            inbox: VecDeque::new(),
        }
    }

    /// Server-assigned session id, once the handshake has happened
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, &self.url)
            .header("Accept", "application/json, text/event-stream");
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = &self.session_id {
            builder = builder.header(SESSION_HEADER, session_id.as_str());
        }
        builder
    }

    fn enqueue(&mut self, value: Value) {
        match value {
            Value::Array(batch) => self.inbox.extend(batch),
            other => self.inbox.push_back(other),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let response = self
            .request(reqwest::Method::POST)
            .json(&message)
            .send()
            .await
            .map_err(io::Error::other)?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(io::Error::other(format!("HTTP {} from MCP server", status)));
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if is_event_stream {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event.map_err(io::Error::other)?;
                if event.data.trim().is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_str(&event.data)?;
                // A JSON-RPC response ends the stream for this request
                let is_response = value.get("id").is_some() && value.get("method").is_none();
                self.enqueue(value);
                if is_response {
                    break;
                }
            }
        } else {
            let body = response.bytes().await.map_err(io::Error::other)?;
            if !body.is_empty() {
                let value: Value = serde_json::from_slice(&body)?;
                self.enqueue(value);
            }
        }

        Ok(())
    }

    async fn receive(&mut self) -> io::Result<Option<Value>> {
        Ok(self.inbox.pop_front())
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.session_id.is_some() {
            // Terminate the server-side session; servers may answer 405 if unsupported
            match self.request(reqwest::Method::DELETE).send().await {
                Ok(response) => debug!(status = %response.status(), "MCP HTTP session closed"),
                Err(e) => debug!(error = %e, "MCP HTTP session close failed"),
            }
        }
        self.session_id = None;
        self.inbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_transport_flattens_batches() {
        let mut transport = HttpTransport::new("http://localhost/mcp", HashMap::new());
        transport.enqueue(serde_json::json!([{"id": 1}, {"id": 2}]));
        transport.enqueue(serde_json::json!({"id": 3}));
        assert_eq!(transport.inbox.len(), 3);
        assert!(transport.session_id().is_none());
    }

    #[tokio::test]
    async fn http_receive_on_empty_inbox_is_none() {
        let mut transport = HttpTransport::new("http://localhost/mcp", HashMap::new());
        assert!(transport.receive().await.unwrap().is_none());
    }
}
