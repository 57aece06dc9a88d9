//! Session module - per-session queues, cancellation and stateful resources
//!
//! Key components:
//!
//! - `SessionManager`: registry of live sessions, one reaper task per session
//! - `Session`: ACTIVE -> INACTIVE state machine, FIFO request queue, pending table
//! - `Request`: payload, response channel and cancellation
//! - `Connector`/`Connection`: stateful connections owned by a dedicated task
//! - `drive_session`: the loop that feeds requests to a `RequestHandler`
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     SessionManager                        │
//! │                                                           │
//! │  get_or_create(id) ──▶ HashMap<SessionId, Arc<Session>>   │
//! │                                                           │
//! │  session_1 ──▶ [queue] ──get_request──▶ [driver 1]        │
//! │     │           ▲                           │             │
//! │  [reaper 1]   add_request            ResponseStream ──▶ caller
//! │                                                           │
//! │  session_2 ──▶ [queue] ──get_request──▶ [driver 2]        │
//! │     │                                                     │
//! │  [reaper 2]                                               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use superagent_core::session::{handler_driver, RequestPayload, SessionConfig, SessionManager};
//!
//! let manager = SessionManager::new(SessionConfig::default());
//! let driver = handler_driver(Arc::new(MyHandler));
//!
//! let session = manager.get_or_create("my-session", true, Some(&driver)).unwrap();
//! let (request, stream) = session.submit(RequestPayload::text("Hello!"));
//!
//! let (chunks, termination) = stream.collect().await;
//! ```

mod connection;
mod driver;
mod manager;
mod request;
mod sandbox;
mod state;
mod types;

pub use connection::{Connection, Connector};
pub use driver::{drive_session, handler_driver, DriverFactory, RequestHandler};
pub use manager::SessionManager;
pub use request::{Request, ResponseStream};
pub use sandbox::SandboxProvider;
pub use state::Session;
pub use types::{
    CancelOutcome, ContentBlock, RequestId, RequestPayload, ResponseFrame, SessionConfig,
    SessionId, SessionStatus, Termination,
};
