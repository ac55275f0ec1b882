//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Time allowed for one connection attempt before it counts as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection attempts before `connect` gives up with a connection fault.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Pause between connection attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Events held for a subscription the client has not seen confirmed yet.
/// Older events beyond this are discarded.
pub const EARLY_EVENT_LIMIT: usize = 1024;
