//! # trove-kernel
//!
//! The index itself: a persistent object store over mounted volumes, a
//! typed attribute schema, a query engine, and monitors that keep query
//! results live as the filesystem changes.
//!
//! Everything mutable lives in one [`Index`] task. Callers talk to it
//! through a cloneable [`IndexHandle`]:
//! - Mountpoints attach and detach volumes; detached objects keep their
//!   identity and come back when the volume does
//! - Queries evaluate once against the store
//! - Monitors re-validate their results in the background, reporting
//!   `Progress`, `Changed` and `UpToDate` through an [`EventSink`]

pub mod checker;
pub mod config;
pub mod error;
pub mod index;
pub mod monitor;
pub mod mount;
pub mod parser;
pub mod query;
pub mod schema;
pub mod store;
pub mod watch;

pub use checker::{CheckItem, CheckerEvent, CheckerTask, ParseOutcome, StalenessChecker};
pub use config::IndexConfig;
pub use error::{IndexError, IndexResult};
pub use trove_types::{EventBus, SubscriberId};
pub use index::{EventSink, Index, IndexHandle, Subscription, start, start_with_parser};
pub use monitor::Monitor;
pub use mount::MountTable;
pub use parser::{FsMetadataParser, MetadataParser, ParseFailure, classify_path};
pub use query::{CompiledQuery, QueryEngine};
pub use schema::SchemaRegistry;
pub use store::{NewObject, ObjectStore};
pub use watch::{FsEvent, FsEventKind, WatchSet};
