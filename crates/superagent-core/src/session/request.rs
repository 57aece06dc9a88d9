//! Requests and their response streams
//!
//! A request carries its payload, the sending half of an unbounded response
//! channel and a cancellation token. The channel always ends with exactly one
//! [`ResponseFrame::End`], whichever path finishes the request.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{RequestId, RequestPayload, ResponseFrame, SessionId, Termination};

/// A unit of work submitted into a session
pub struct Request {
    id: RequestId,
    session_id: SessionId,
    payload: RequestPayload,
    created_at: DateTime<Utc>,
    /// Taken when the end frame is sent, so nothing follows it
    sender: Mutex<Option<mpsc::UnboundedSender<ResponseFrame>>>,
    canceled: AtomicBool,
    stream_started: AtomicBool,
    cancel_token: CancellationToken,
    done: CancellationToken,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl Request {
    /// Create a request and the stream its caller reads from
    pub fn new(session_id: impl Into<SessionId>, payload: RequestPayload) -> (Arc<Self>, ResponseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        let request = Arc::new(Self {
            id: id.clone(),
            session_id: session_id.into(),
            payload,
            created_at: Utc::now(),
            sender: Mutex::new(Some(tx)),
            canceled: AtomicBool::new(false),
            stream_started: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            done: CancellationToken::new(),
            stream_task: Mutex::new(None),
        });
        let stream = ResponseStream {
            request_id: id,
            rx,
            finished: false,
        };
        (request, stream)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Token cancelled when the request is canceled; handlers may watch it
    /// at their own suspension points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Push a response chunk. Returns false once the stream has ended.
    pub fn send_chunk(&self, chunk: impl Into<String>) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(ResponseFrame::Chunk(chunk.into())).is_ok(),
            None => false,
        }
    }

    /// End the stream. Only the first call has any effect; returns whether
    /// this call was it.
    pub fn terminate(&self, termination: Termination) -> bool {
        let Some(tx) = self.sender.lock().take() else {
            return false;
        };
        debug!(request_id = %self.id, session_id = %self.session_id, ?termination, "Request terminated");
        // The caller may have stopped listening
        let _ = tx.send(ResponseFrame::End(termination));
        self.done.cancel();
        true
    }

    /// Run `work` as this request's stream task.
    ///
    /// The work races the cancellation token; handler errors and panics are
    /// turned into [`Termination::Failed`] and the stream is always ended.
    pub fn spawn_stream<F>(self: &Arc<Self>, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.stream_started.store(true, Ordering::SeqCst);
        let request = Arc::clone(self);
        let token = self.cancel_token.clone();
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Termination::Canceled,
                result = AssertUnwindSafe(work).catch_unwind() => match result {
                    Ok(Ok(())) => Termination::Completed,
                    Ok(Err(e)) => Termination::Failed(format!("{:#}", e)),
                    Err(panic) => Termination::Failed(panic_message(panic.as_ref())),
                },
            };
            request.terminate(outcome);
        });
        *self.stream_task.lock() = Some(handle);
    }

    /// Cancel the request.
    ///
    /// Sets the canceled flag, cancels the stream task and waits for it to
    /// wind down. Idempotent; a second call returns immediately.
    pub async fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(request_id = %self.id, session_id = %self.session_id, "Canceling request");
        self.cancel_token.cancel();

        let handle = self.stream_task.lock().take();
        match handle {
            // Cancellation is not an error for the canceller
            Some(handle) => {
                let _ = handle.await;
            }
            None if self.stream_started.load(Ordering::SeqCst) => self.done.cancelled().await,
            None => {}
        }
        self.terminate(Termination::Canceled);
    }

    /// Wait for the stream task to finish. Used by the driver.
    pub async fn join(&self) {
        let handle = self.stream_task.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(request_id = %self.id, error = %e, "Stream task did not complete");
                    self.terminate(Termination::Failed(e.to_string()));
                }
            }
            // Someone else (cancel) holds the handle and will end the stream
            None if self.stream_started.load(Ordering::SeqCst) => self.done.cancelled().await,
            None => {}
        }
        self.terminate(Termination::Completed);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("canceled", &self.is_canceled())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_string()
    }
}

/// Receiving half of a request's response channel
#[derive(Debug)]
pub struct ResponseStream {
    request_id: RequestId,
    rx: mpsc::UnboundedReceiver<ResponseFrame>,
    finished: bool,
}

impl ResponseStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next frame. Yields the end frame once, then `None`.
    pub async fn recv(&mut self) -> Option<ResponseFrame> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(frame) => {
                if frame.is_end() {
                    self.finished = true;
                }
                Some(frame)
            }
            None => {
                self.finished = true;
                Some(ResponseFrame::End(Termination::Failed(
                    "response channel closed without terminator".to_string(),
                )))
            }
        }
    }

    /// Drain to the terminator
    pub async fn collect(mut self) -> (Vec<String>, Termination) {
        let mut chunks = Vec::new();
        while let Some(frame) = self.recv().await {
            match frame {
                ResponseFrame::Chunk(chunk) => chunks.push(chunk),
                ResponseFrame::End(termination) => return (chunks, termination),
            }
        }
        (
            chunks,
            Termination::Failed("response stream already finished".to_string()),
        )
    }
}
