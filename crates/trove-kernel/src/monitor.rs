//! Live query state.
//!
//! A [`Monitor`] binds one compiled query to one subscriber. It remembers the
//! result set it last delivered as an identity → revision snapshot, so a
//! change is detected by comparing revisions instead of attribute payloads.
//!
//! ```text
//!   INITIAL ──start──▶ SCANNING ──batch done, nothing dirty──▶ IDLE
//!                        │  ▲                                   │
//!                        └──┘ re-check round                    │
//!                        ▲                                      │
//!                        └──────── change notification ─────────┘
//!   * ──stop──▶ STOPPED
//! ```
//!
//! The monitor itself never touches the store or the filesystem; the index
//! drives it and feeds it the current results.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use trove_types::{ClientId, EventBus, MonitorEvent, MonitorState, Object, ObjectKey, SubscriptionId};

use crate::checker::CheckerTask;
use crate::query::CompiledQuery;

pub struct Monitor {
    id: SubscriptionId,
    client: ClientId,
    query: CompiledQuery,
    state: MonitorState,
    snapshot: BTreeMap<ObjectKey, u64>,
    /// Directories this monitor holds a watch reference on.
    watched: BTreeSet<PathBuf>,
    checker: Option<CheckerTask>,
    rounds: u32,
    pending_rescan: bool,
    bus: EventBus<MonitorEvent>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("state", &self.state)
            .field("objects", &self.snapshot.len())
            .field("rounds", &self.rounds)
            .finish()
    }
}

impl Monitor {
    /// A new monitor whose snapshot is the result set the subscriber was
    /// handed.
    pub fn new(id: SubscriptionId, client: ClientId, query: CompiledQuery, initial: &[Object]) -> Self {
        Self {
            id,
            client,
            query,
            state: MonitorState::Initial,
            snapshot: snapshot_of(initial),
            watched: BTreeSet::new(),
            checker: None,
            rounds: 0,
            pending_rescan: false,
            bus: EventBus::new(),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn query(&self) -> &CompiledQuery {
        &self.query
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn bus(&self) -> &EventBus<MonitorEvent> {
        &self.bus
    }

    /// Identities of the last delivered result set.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.snapshot.keys().cloned().collect()
    }

    pub fn holds(&self, key: &ObjectKey) -> bool {
        self.snapshot.contains_key(key)
    }

    pub fn watched(&self) -> &BTreeSet<PathBuf> {
        &self.watched
    }

    /// Replace the watched set, returning `(to_watch, to_unwatch)`.
    pub fn rewatch(&mut self, dirs: BTreeSet<PathBuf>) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let add = dirs.difference(&self.watched).cloned().collect();
        let drop = self.watched.difference(&dirs).cloned().collect();
        self.watched = dirs;
        (add, drop)
    }

    /// Forget watched directories under `prefix`, returning them.
    pub fn unwatch_under(&mut self, prefix: &std::path::Path) -> Vec<PathBuf> {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|d| d.starts_with(prefix))
            .cloned()
            .collect();
        for dir in &gone {
            self.watched.remove(dir);
        }
        gone
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn pending_rescan(&self) -> bool {
        self.pending_rescan
    }

    /// Enter a new scan cycle.
    pub fn begin_scan(&mut self) {
        tracing::debug!(subscription = %self.id, from = %self.state, "monitor scanning");
        self.state = MonitorState::Scanning;
        self.rounds = 0;
        self.pending_rescan = false;
    }

    /// A change arrived while scanning; run another round before settling.
    pub fn request_rescan(&mut self) {
        self.pending_rescan = true;
    }

    /// Bind the checker batch for the next round.
    pub fn bind_checker(&mut self, task: CheckerTask) {
        self.rounds += 1;
        self.pending_rescan = false;
        self.checker = Some(task);
    }

    /// Drop the checker binding after its batch completed.
    pub fn release_checker(&mut self) {
        self.checker = None;
    }

    fn cancel_checker(&mut self) -> Option<u64> {
        self.checker.take().map(|task| {
            task.cancel();
            task.id()
        })
    }

    /// Compare `current` against the snapshot.
    pub fn diff(&self, current: &[Object]) -> Option<MonitorEvent> {
        let now = snapshot_of(current);
        let added: Vec<ObjectKey> = now
            .keys()
            .filter(|k| !self.snapshot.contains_key(*k))
            .cloned()
            .collect();
        let removed: Vec<ObjectKey> = self
            .snapshot
            .keys()
            .filter(|k| !now.contains_key(*k))
            .cloned()
            .collect();
        let updated: Vec<ObjectKey> = now
            .iter()
            .filter(|(k, rev)| self.snapshot.get(*k).is_some_and(|old| old != *rev))
            .map(|(k, _)| k.clone())
            .collect();
        if added.is_empty() && removed.is_empty() && updated.is_empty() {
            None
        } else {
            Some(MonitorEvent::Changed { added, removed, updated })
        }
    }

    /// Publish to subscribers. A stopped monitor delivers nothing.
    pub fn deliver(&self, event: MonitorEvent) {
        if self.state == MonitorState::Stopped {
            return;
        }
        tracing::trace!(subscription = %self.id, event = event.name(), "monitor event");
        self.bus.publish(&event);
    }

    fn deliver_changes(&mut self, current: &[Object]) -> bool {
        let Some(changed) = self.diff(current) else {
            return false;
        };
        self.snapshot = snapshot_of(current);
        self.deliver(changed);
        true
    }

    /// Close a scan cycle: `Changed` if the result set moved, then
    /// `UpToDate`, then idle.
    pub fn complete(&mut self, current: &[Object]) {
        self.checker = None;
        self.deliver_changes(current);
        self.deliver(MonitorEvent::UpToDate);
        self.state = MonitorState::Idle;
        tracing::debug!(subscription = %self.id, rounds = self.rounds, "monitor up to date");
    }

    /// Deliver out-of-cycle changes to an idle monitor as a cycle of its own.
    /// Returns false when nothing moved.
    pub fn refresh(&mut self, current: &[Object]) -> bool {
        if self.state != MonitorState::Idle || self.diff(current).is_none() {
            return false;
        }
        self.complete(current);
        true
    }

    /// End a scan early (its storage went away). Whatever changed so far is
    /// delivered, but no `UpToDate`: the cycle did not finish.
    ///
    /// Returns the cancelled checker task, if one was running.
    pub fn abort_scan(&mut self, current: &[Object]) -> Option<u64> {
        let task = self.cancel_checker();
        self.deliver_changes(current);
        self.state = MonitorState::Idle;
        self.pending_rescan = false;
        tracing::debug!(subscription = %self.id, "monitor scan aborted");
        task
    }

    /// Terminal. Cancels outstanding checker work and drops every subscriber.
    /// Returns the cancelled task and the directories to unwatch.
    pub fn stop(&mut self) -> (Option<u64>, Vec<PathBuf>) {
        let task = self.cancel_checker();
        self.state = MonitorState::Stopped;
        self.bus.clear();
        let watched = std::mem::take(&mut self.watched).into_iter().collect();
        tracing::debug!(subscription = %self.id, "monitor stopped");
        (task, watched)
    }
}

fn snapshot_of(objects: &[Object]) -> BTreeMap<ObjectKey, u64> {
    objects.iter().map(|o| (o.key.clone(), o.revision)).collect()
}
