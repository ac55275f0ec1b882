//! Wire frames exchanged between the index server and its clients.
//!
//! The transport is newline-delimited JSON over a Unix socket. A client
//! writes [`Request`] lines; the server writes [`ServerFrame`] lines, which
//! are either the [`ServerFrame::Response`] to a request (matched by `id`)
//! or an unsolicited [`ServerFrame::Notification`] carrying a monitor event.
//!
//! ```text
//! client                                   server
//!   │  {"id":1,"body":{"op":"query",..}}      │
//!   │ ──────────────────────────────────────▶ │
//!   │  {"frame":"response","id":1,..}         │
//!   │ ◀────────────────────────────────────── │
//!   │  {"id":2,"body":{"op":"monitor",..}}    │
//!   │ ──────────────────────────────────────▶ │
//!   │  {"frame":"response","id":2,..}         │
//!   │  {"frame":"notification",..progress}    │
//!   │  {"frame":"notification",..up_to_date}  │
//!   │ ◀────────────────────────────────────── │
//! ```
//!
//! Notifications are fire-and-forget; per-subscription order is preserved.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{ObjectKey, ResultSetId, SubscriptionId};
use crate::monitor::{MonitorEvent, MonitorState};
use crate::mount::Mountpoint;
use crate::object::{AttrValue, Object};
use crate::query::Query;

// ============================================================================
// Requests
// ============================================================================

/// One client request line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen correlation id, echoed in the response.
    pub id: u64,
    pub body: RequestBody,
}

/// Operation requested by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestBody {
    /// Evaluate a query; the result set is held server-side under a handle.
    Query { query: Query },
    /// Keep a previously returned result set live.
    Monitor { handle: ResultSetId },
    /// Stop a monitor. Idempotent.
    Stop { subscription: SubscriptionId },
    /// Drop a result-set handle that will not be monitored.
    Release { handle: ResultSetId },
    Get { key: ObjectKey },
    Children { key: ObjectKey },
    /// Set (or clear, with `None`) one attribute on an object.
    SetAttribute {
        key: ObjectKey,
        attr: String,
        value: Option<AttrValue>,
    },
    AddMountpoint { mountpoint: Mountpoint },
    RemoveMountpoint { mount_path: PathBuf },
    ListMounts,
    Stats,
}

impl RequestBody {
    /// Short operation name used in logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Monitor { .. } => "monitor",
            Self::Stop { .. } => "stop",
            Self::Release { .. } => "release",
            Self::Get { .. } => "get",
            Self::Children { .. } => "children",
            Self::SetAttribute { .. } => "set_attribute",
            Self::AddMountpoint { .. } => "add_mountpoint",
            Self::RemoveMountpoint { .. } => "remove_mountpoint",
            Self::ListMounts => "list_mounts",
            Self::Stats => "stats",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Successful response payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// A query's initial result set and the handle to monitor it by.
    ResultSet {
        handle: ResultSetId,
        objects: Vec<Object>,
    },
    /// A monitor subscription. `objects` is the result set the monitor starts
    /// from; later `Changed` notifications are diffs against it.
    Subscribed {
        subscription: SubscriptionId,
        state: MonitorState,
        objects: Vec<ObjectKey>,
    },
    Object { object: Object },
    Objects { objects: Vec<Object> },
    Mounts { mounts: Vec<Mountpoint> },
    Stats { stats: ServerStats },
    /// The request succeeded and carries no payload.
    Ack,
}

/// Counters describing live server resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub clients: u64,
    pub monitors: u64,
    pub result_sets: u64,
    pub watched_dirs: u64,
    pub checker_tasks: u64,
    pub mounts: u64,
    pub objects: u64,
}

// ============================================================================
// Faults
// ============================================================================

/// Distinct fault kinds visible across the process boundary.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultKind {
    NotFound,
    InvalidPredicate,
    InvalidRequest,
    Connection,
    Internal,
}

/// An error reported by the server in place of a response body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: FaultKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One server output line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        id: u64,
        result: Result<ResponseBody, RemoteError>,
    },
    Notification {
        subscription: SubscriptionId,
        event: MonitorEvent,
    },
}
