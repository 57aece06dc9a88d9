//! Session driver loop
//!
//! The driver is the only consumer of a session's queue. It hands each
//! request to a [`RequestHandler`] (the reasoning engine) and releases the
//! session once it turns inactive.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, info};

use super::request::Request;
use super::state::Session;
use super::types::SessionStatus;

/// Produces the streamed output for one request.
///
/// Implementations push chunks with [`Request::send_chunk`] and should call
/// [`Session::activate`] during long operations. Returning an error ends the
/// stream with `Termination::Failed`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, session: Arc<Session>, request: Arc<Request>) -> anyhow::Result<()>;
}

/// Starts the driver for a freshly created session
pub type DriverFactory = Arc<dyn Fn(Arc<Session>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Serve `session` with `handler` until the session turns inactive, then
/// release its resources.
pub async fn drive_session<H>(session: Arc<Session>, handler: Arc<H>)
where
    H: RequestHandler + ?Sized,
{
    info!(session_id = %session.id(), "Driver started");
    let mut served = 0usize;

    loop {
        let (request, status) = session.get_request().await;
        let Some(request) = request else {
            if status == SessionStatus::Inactive {
                break;
            }
            continue;
        };

        // Canceled between dequeue and now
        if request.is_canceled() {
            session.finish_request(&request);
            continue;
        }

        session.activate();
        debug!(session_id = %session.id(), request_id = %request.id(), "Serving request");

        let work = {
            let handler = Arc::clone(&handler);
            let session = Arc::clone(&session);
            let request = Arc::clone(&request);
            async move { handler.handle(session, request).await }
        };
        request.spawn_stream(work);
        request.join().await;

        session.finish_request(&request);
        session.activate();
        served += 1;
    }

    session.release().await;
    info!(session_id = %session.id(), served, "Driver stopped");
}

/// Driver factory serving every session with the same handler
pub fn handler_driver<H>(handler: Arc<H>) -> DriverFactory
where
    H: RequestHandler + ?Sized,
{
    Arc::new(move |session| drive_session(session, Arc::clone(&handler)).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RequestPayload, SessionConfig, Termination};
    use std::time::Duration;

    struct Upper;

    #[async_trait]
    impl RequestHandler for Upper {
        async fn handle(&self, _session: Arc<Session>, request: Arc<Request>) -> anyhow::Result<()> {
            let text = request.payload().text_content();
            if text.is_empty() {
                anyhow::bail!("empty request");
            }
            request.send_chunk(text.to_uppercase());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_driver_serves_in_order() {
        let session = Session::new("drv", SessionConfig::default());
        let driver = tokio::spawn(drive_session(Arc::clone(&session), Arc::new(Upper)));

        let (_, first) = session.submit(RequestPayload::text("one"));
        let (_, second) = session.submit(RequestPayload::default());
        let (_, third) = session.submit(RequestPayload::text("three"));

        assert_eq!(first.collect().await, (vec!["ONE".to_string()], Termination::Completed));
        assert!(matches!(second.collect().await.1, Termination::Failed(_)));
        assert_eq!(third.collect().await.0, vec!["THREE".to_string()]);

        session.deactivate();
        driver.await.unwrap();
        assert!(session.is_released());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_releases_on_expiry() {
        let config = SessionConfig::default().with_expiry(Duration::from_secs(3));
        let session = Session::new("drv-idle", config);
        let factory = handler_driver(Arc::new(Upper));

        factory(Arc::clone(&session)).await;
        assert_eq!(session.status(), SessionStatus::Inactive);
        assert!(session.is_released());
    }
}
