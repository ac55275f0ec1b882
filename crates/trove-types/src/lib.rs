//! Shared object, query, and wire types for trove.
//!
//! This crate is the vocabulary every other trove crate speaks: object
//! identity, typed attribute values, the attribute schema classes, query
//! predicates, monitor events, and the frames exchanged between the index
//! server and its clients. It has **no internal trove dependencies**.
//!
//! # Relationship Overview
//!
//! ```text
//! Mountpoint (mount_path, volume_id)
//!     └── root Object ("dir")
//!           └── child Objects ("dir", "file", "audio", ...)
//!                 parent = (type, id), never a pointer
//!
//! Query (predicates + optional dirname anchor)
//!     └── result set: ordered ObjectKeys (immutable snapshot)
//!           └── Monitor keeps it live: Progress* → Changed? → UpToDate
//! ```
//!
//! # Key Types
//!
//! |-------------------|----------------------------------------------|
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`ObjectKey`]     | Identity `(type, id)`                        |
//! | [`Object`]        | Stored entity + attributes + mtime           |
//! | [`AttrValue`]     | Typed attribute value                        |
//! | [`AttrSpec`]      | Schema entry: name → class → value kind      |
//! | [`Query`]         | Immutable predicate set + dirname anchor     |
//! | [`MonitorEvent`]  | `progress`, `changed`, `up-to-date`          |
//! | [`Mountpoint`]    | Logical root mapped onto a physical path     |
//! | [`Request`]       | Client → server frame                        |
//! | [`ServerFrame`]   | Server → client frame                        |
//! |-------------------|----------------------------------------------|

pub mod events;
pub mod ids;
pub mod monitor;
pub mod mount;
pub mod object;
pub mod protocol;
pub mod query;
pub mod schema;

pub use events::{EventBus, SubscriberId};
pub use ids::{ClientId, ObjectKey, ResultSetId, SubscriptionId};
pub use monitor::{MonitorEvent, MonitorState};
pub use mount::{MountKind, Mountpoint, normalize_path};
pub use object::{AttrValue, Attributes, Object, ObjectState};
pub use protocol::{
    FaultKind, RemoteError, Request, RequestBody, ResponseBody, ServerFrame, ServerStats,
};
pub use query::{PatternExpr, Predicate, Query};
pub use schema::{AttrClass, AttrSpec, ValueKind};

/// Built-in object type tag for directories.
pub const TYPE_DIR: &str = "dir";
/// Built-in object type tag for plain files.
pub const TYPE_FILE: &str = "file";

/// Current time as Unix seconds.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
