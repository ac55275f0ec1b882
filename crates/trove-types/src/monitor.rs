//! Monitor states and the events a monitor delivers.
//!
//! For one monitor, every scan cycle delivers events in the order
//! `Progress* , Changed? , UpToDate`.

use serde::{Deserialize, Serialize};

use crate::ids::ObjectKey;

/// Lifecycle of a live query.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MonitorState {
    Initial,
    Scanning,
    Idle,
    /// Terminal: detached from change notifications, no further events.
    Stopped,
}

/// Event pushed to a monitor's subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// The checker finished `done` of `total` re-parses in the current batch.
    Progress { done: u64, total: u64 },
    /// The result set changed since the last delivery.
    Changed {
        added: Vec<ObjectKey>,
        removed: Vec<ObjectKey>,
        updated: Vec<ObjectKey>,
    },
    /// The scan cycle finished; the delivered result set is current.
    UpToDate,
}

impl MonitorEvent {
    pub fn is_progress(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Changed { .. } => "changed",
            Self::UpToDate => "up-to-date",
        }
    }
}
