//! trove client library
//!
//! Talks to a `trove-server` over its Unix socket. Every operation goes
//! through an explicit [`Session`]; a process that only ever needs one may
//! register it once with [`set_default_session`] and fetch it anywhere with
//! [`default_session`].
//!
//! ```ignore
//! let session = trove_client::connect("/run/user/1000/trove/trove.sock").await?;
//! let results = session.query(Query::new([Predicate::eq("type", "audio")])).await?;
//! let mut monitor = session.monitor(&results).await?;
//! while let Some(event) = monitor.next_event().await {
//!     println!("{} ({} objects)", event.name(), monitor.objects().len());
//! }
//! ```

use std::sync::OnceLock;

pub mod constants;
pub mod error;
pub mod monitor;
pub mod session;

pub use error::{ClientError, ClientResult};
pub use monitor::MonitorProxy;
pub use session::{ResultSet, Session, connect};

static DEFAULT_SESSION: OnceLock<Session> = OnceLock::new();

/// Register the process-wide session. Only the first call wins; later calls
/// hand their session back.
pub fn set_default_session(session: Session) -> Result<(), Session> {
    DEFAULT_SESSION.set(session)
}

/// The process-wide session, if one was registered.
pub fn default_session() -> ClientResult<Session> {
    DEFAULT_SESSION
        .get()
        .cloned()
        .ok_or_else(|| ClientError::Connection("no default session registered".into()))
}
