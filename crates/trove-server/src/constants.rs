//! Server constants.
//!
//! Values that are not worth a config knob.

/// Longest request line accepted from a client. Longer lines close the
/// connection.
pub const MAX_REQUEST_LINE: usize = 1 << 20;

/// Socket file mode: owner read/write only.
pub const SOCKET_MODE: u32 = 0o600;
