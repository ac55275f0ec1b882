//! The single-writer index.
//!
//! [`Index`] owns the object store, the mount table, the watch set and every
//! monitor. It runs as one task, processing [`IndexCommand`]s one at a time
//! interleaved with checker results, filesystem notifications and delayed
//! rescans. Nothing else writes to the store, so reads need no locking.
//!
//! ```text
//!   IndexHandle (Send+Sync)   mpsc      Index task
//!   ┌───────────────────┐  ───────▶  ┌───────────────────────────────┐
//!   │ .query()          │            │ ObjectStore   MountTable      │
//!   │ .monitor()        │  ◀───────  │ Monitors      WatchSet        │
//!   │ .add_mountpoint() │  oneshot   │      ▲             │          │
//!   └───────────────────┘            │      │ CheckerEvent│ FsEvent  │
//!                                    │  StalenessChecker ◀┘          │
//!                                    └───────────────────────────────┘
//! ```
//!
//! Monitor events leave through the [`EventSink`] handed to
//! [`IndexHandle::monitor`], tagged with their subscription.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use trove_types::{
    AttrValue, ClientId, MonitorEvent, MonitorState, MountKind, Mountpoint, Object, ObjectKey,
    ObjectState, Query, ServerStats, SubscriptionId, TYPE_DIR,
};

use crate::checker::{CheckItem, CheckerEvent, ParseOutcome, StalenessChecker, TaskId};
use crate::config::IndexConfig;
use crate::error::{IndexError, IndexResult};
use crate::monitor::Monitor;
use crate::mount::MountTable;
use crate::parser::{FsMetadataParser, MetadataParser, classify_path};
use crate::query::QueryEngine;
use crate::schema::{SchemaRegistry, is_pseudo};
use crate::store::{NewObject, ObjectStore};
use crate::watch::{FsEvent, WatchSet};

/// Raw filesystem notifications buffered before the index drops them.
const FS_EVENT_BUFFER: usize = 1024;

/// Where a monitor's events go.
pub type EventSink = mpsc::UnboundedSender<(SubscriptionId, MonitorEvent)>;

/// A monitor as seen by its subscriber right after `monitor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub state: MonitorState,
    /// The result set the monitor's first `Changed` is relative to.
    pub objects: Vec<ObjectKey>,
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum IndexCommand {
    Query {
        query: Query,
        reply: oneshot::Sender<IndexResult<Vec<Object>>>,
    },
    Get {
        key: ObjectKey,
        reply: oneshot::Sender<IndexResult<Object>>,
    },
    Children {
        key: ObjectKey,
        reply: oneshot::Sender<IndexResult<Vec<Object>>>,
    },
    SetAttribute {
        key: ObjectKey,
        attr: String,
        value: Option<AttrValue>,
        reply: oneshot::Sender<IndexResult<Object>>,
    },
    Monitor {
        client: ClientId,
        query: Query,
        sink: EventSink,
        reply: oneshot::Sender<IndexResult<Subscription>>,
    },
    MonitorState {
        subscription: SubscriptionId,
        reply: oneshot::Sender<Option<MonitorState>>,
    },
    StopMonitor {
        client: ClientId,
        subscription: SubscriptionId,
        reply: oneshot::Sender<IndexResult<bool>>,
    },
    ReleaseClient {
        client: ClientId,
        reply: oneshot::Sender<usize>,
    },
    AddMountpoint {
        mountpoint: Mountpoint,
        reply: oneshot::Sender<IndexResult<Object>>,
    },
    RemoveMountpoint {
        mount_path: PathBuf,
        reply: oneshot::Sender<IndexResult<Option<Mountpoint>>>,
    },
    ListMounts {
        reply: oneshot::Sender<Vec<Mountpoint>>,
    },
    Stats {
        reply: oneshot::Sender<IndexResult<ServerStats>>,
    },
    Rescan {
        path: PathBuf,
        reply: oneshot::Sender<IndexResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// IndexHandle (Send + Sync public API)
// ============================================================================

/// Cloneable handle to a running [`Index`].
///
/// Each method sends a command and awaits the reply. Once the index task is
/// gone every call fails with [`IndexError::Shutdown`].
#[derive(Clone)]
pub struct IndexHandle {
    tx: mpsc::UnboundedSender<IndexCommand>,
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl IndexHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> IndexCommand) -> IndexResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).map_err(|_| IndexError::Shutdown)?;
        rx.await.map_err(|_| IndexError::Shutdown)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Evaluate a query once. A dirname-anchored query lists the directory
    /// against the filesystem first.
    pub async fn query(&self, query: Query) -> IndexResult<Vec<Object>> {
        self.call(|reply| IndexCommand::Query { query, reply }).await?
    }

    pub async fn get(&self, key: ObjectKey) -> IndexResult<Object> {
        self.call(|reply| IndexCommand::Get { key, reply }).await?
    }

    /// Reachable children in directory scan order.
    pub async fn children(&self, key: ObjectKey) -> IndexResult<Vec<Object>> {
        self.call(|reply| IndexCommand::Children { key, reply }).await?
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Set (`Some`) or clear (`None`) a declared attribute.
    pub async fn set_attribute(
        &self,
        key: ObjectKey,
        attr: &str,
        value: Option<AttrValue>,
    ) -> IndexResult<Object> {
        let attr = attr.to_string();
        self.call(|reply| IndexCommand::SetAttribute { key, attr, value, reply })
            .await?
    }

    // ── Monitors ─────────────────────────────────────────────────────────

    /// Start keeping `query` live for `client`. Asking again for the same
    /// `(client, query)` returns the existing monitor and leaves `sink` unused.
    pub async fn monitor(&self, client: ClientId, query: Query, sink: EventSink) -> IndexResult<Subscription> {
        self.call(|reply| IndexCommand::Monitor { client, query, sink, reply })
            .await?
    }

    pub async fn monitor_state(&self, subscription: SubscriptionId) -> IndexResult<Option<MonitorState>> {
        self.call(|reply| IndexCommand::MonitorState { subscription, reply })
            .await
    }

    /// Stop one of `client`'s monitors. Returns false if it was already gone;
    /// a monitor held by another client is `NotFound`.
    pub async fn stop_monitor(&self, client: ClientId, subscription: SubscriptionId) -> IndexResult<bool> {
        self.call(|reply| IndexCommand::StopMonitor { client, subscription, reply })
            .await?
    }

    /// Stop every monitor a client holds. Returns how many were stopped.
    pub async fn release_client(&self, client: ClientId) -> IndexResult<usize> {
        self.call(|reply| IndexCommand::ReleaseClient { client, reply })
            .await
    }

    /// Re-list a directory now, as if a change notification had arrived.
    pub async fn rescan(&self, path: impl Into<PathBuf>) -> IndexResult<()> {
        let path = path.into();
        self.call(|reply| IndexCommand::Rescan { path, reply }).await?
    }

    // ── Mounts ───────────────────────────────────────────────────────────

    /// Attach a mountpoint and scan it. Returns its root object.
    pub async fn add_mountpoint(&self, mountpoint: Mountpoint) -> IndexResult<Object> {
        self.call(|reply| IndexCommand::AddMountpoint { mountpoint, reply })
            .await?
    }

    /// Detach the mountpoint at `mount_path`. Its objects become unreachable
    /// but are kept for the volume's return.
    pub async fn remove_mountpoint(&self, mount_path: impl Into<PathBuf>) -> IndexResult<Option<Mountpoint>> {
        let mount_path = mount_path.into();
        self.call(|reply| IndexCommand::RemoveMountpoint { mount_path, reply })
            .await?
    }

    pub async fn list_mounts(&self) -> IndexResult<Vec<Mountpoint>> {
        self.call(|reply| IndexCommand::ListMounts { reply }).await
    }

    pub async fn stats(&self) -> IndexResult<ServerStats> {
        self.call(|reply| IndexCommand::Stats { reply }).await?
    }

    /// Stop every monitor and end the index task.
    pub async fn shutdown(&self) -> IndexResult<()> {
        self.call(|reply| IndexCommand::Shutdown { reply }).await
    }
}

// ============================================================================
// Index
// ============================================================================

/// A path that dropped out of its directory listing.
struct Missing {
    volume: String,
    since: Instant,
}

/// The index task's state.
pub struct Index {
    config: IndexConfig,
    store: ObjectStore,
    mounts: MountTable,
    watches: WatchSet,
    checker: StalenessChecker,
    monitors: BTreeMap<SubscriptionId, Monitor>,
    tasks: HashMap<TaskId, SubscriptionId>,
    missing: HashMap<ObjectKey, Missing>,
    next_subscription: u64,
    checker_tx: mpsc::UnboundedSender<CheckerEvent>,
    checker_rx: mpsc::UnboundedReceiver<CheckerEvent>,
    fs_rx: mpsc::Receiver<FsEvent>,
    rescan_tx: mpsc::UnboundedSender<PathBuf>,
    rescan_rx: mpsc::UnboundedReceiver<PathBuf>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("store", &self.store)
            .field("mounts", &self.mounts.len())
            .field("monitors", &self.monitors.len())
            .field("watches", &self.watches)
            .finish()
    }
}

/// Open the index described by `config`, start its task, and attach the
/// configured local roots.
pub async fn start(config: IndexConfig) -> IndexResult<IndexHandle> {
    start_with_parser(config, Arc::new(FsMetadataParser)).await
}

/// [`start`] with a custom metadata parser.
pub async fn start_with_parser(config: IndexConfig, parser: Arc<dyn MetadataParser>) -> IndexResult<IndexHandle> {
    let roots = config.roots.clone();
    let handle = Index::with_parser(config, parser)?.spawn();
    for root in roots {
        let mountpoint = Mountpoint::new(MountKind::Local, "", root, None);
        if let Err(e) = handle.add_mountpoint(mountpoint.clone()).await {
            tracing::warn!(path = %mountpoint.mount_path.display(), error = %e, "failed to attach root");
        }
    }
    Ok(handle)
}

impl Index {
    /// Open the store with the built-in filesystem parser.
    pub fn open(config: IndexConfig) -> IndexResult<Self> {
        Self::with_parser(config, Arc::new(FsMetadataParser))
    }

    pub fn with_parser(config: IndexConfig, parser: Arc<dyn MetadataParser>) -> IndexResult<Self> {
        let schema = SchemaRegistry::from_config(&config)?;
        let store = if config.db_path == Path::new(":memory:") {
            ObjectStore::in_memory(schema)?
        } else {
            ObjectStore::open(&config.db_path, schema)?
        };
        Self::with_store(config, store, parser)
    }

    /// Build around an already opened store.
    pub fn with_store(config: IndexConfig, mut store: ObjectStore, parser: Arc<dyn MetadataParser>) -> IndexResult<Self> {
        let orphans = store.orphans()?;
        if let Some(first) = orphans.first() {
            tracing::warn!(count = orphans.len(), first = %first, "objects with a missing parent");
        }
        let detached = store.mark_all_unreachable()?;
        tracing::info!(
            objects = store.object_count()?,
            detached,
            generation = store.schema().generation(),
            "index opened"
        );

        let (checker_tx, checker_rx) = mpsc::unbounded_channel();
        let (fs_tx, fs_rx) = mpsc::channel(FS_EVENT_BUFFER);
        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();
        let checker = StalenessChecker::new(parser, config.checker_workers);

        Ok(Self {
            config,
            store,
            mounts: MountTable::new(),
            watches: WatchSet::new(fs_tx),
            checker,
            monitors: BTreeMap::new(),
            tasks: HashMap::new(),
            missing: HashMap::new(),
            next_subscription: 0,
            checker_tx,
            checker_rx,
            fs_rx,
            rescan_tx,
            rescan_rx,
        })
    }

    /// Run on the current runtime. The task ends on `shutdown` or when every
    /// handle has been dropped.
    pub fn spawn(self) -> IndexHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx));
        IndexHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<IndexCommand>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(IndexCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.checker_rx.recv() => self.on_checker_event(event).await,
                Some(event) = self.fs_rx.recv() => self.on_fs_event(event).await,
                Some(dir) = self.rescan_rx.recv() => {
                    if let Err(e) = self.rescan(&dir).await {
                        tracing::warn!(dir = %dir.display(), error = %e, "delayed rescan failed");
                    }
                }
            }
        }
        tracing::debug!("index task finished");
    }

    async fn handle_command(&mut self, cmd: IndexCommand) {
        match cmd {
            IndexCommand::Query { query, reply } => {
                let _ = reply.send(self.query(&query).await);
            }
            IndexCommand::Get { key, reply } => {
                let _ = reply.send(self.store.get(&key));
            }
            IndexCommand::Children { key, reply } => {
                let _ = reply.send(self.store.children_of(&key));
            }
            IndexCommand::SetAttribute { key, attr, value, reply } => {
                let _ = reply.send(self.set_attribute(&key, &attr, value));
            }
            IndexCommand::Monitor { client, query, sink, reply } => {
                let _ = reply.send(self.monitor(client, query, sink).await);
            }
            IndexCommand::MonitorState { subscription, reply } => {
                let _ = reply.send(self.monitors.get(&subscription).map(Monitor::state));
            }
            IndexCommand::StopMonitor { client, subscription, reply } => {
                let _ = reply.send(self.stop_owned(client, subscription));
            }
            IndexCommand::ReleaseClient { client, reply } => {
                let _ = reply.send(self.release_client(client));
            }
            IndexCommand::AddMountpoint { mountpoint, reply } => {
                let _ = reply.send(self.add_mountpoint(mountpoint).await);
            }
            IndexCommand::RemoveMountpoint { mount_path, reply } => {
                let _ = reply.send(self.remove_mountpoint(&mount_path));
            }
            IndexCommand::ListMounts { reply } => {
                let _ = reply.send(self.mounts.list());
            }
            IndexCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            IndexCommand::Rescan { path, reply } => {
                let _ = reply.send(self.rescan(&path).await);
            }
            IndexCommand::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn shutdown(&mut self) {
        let ids: Vec<SubscriptionId> = self.monitors.keys().copied().collect();
        for id in ids {
            self.stop_monitor(id);
        }
        tracing::info!("index shutting down");
    }

    fn stats(&self) -> IndexResult<ServerStats> {
        let clients: BTreeSet<ClientId> = self.monitors.values().map(Monitor::client).collect();
        Ok(ServerStats {
            clients: clients.len() as u64,
            monitors: self.monitors.len() as u64,
            result_sets: 0,
            watched_dirs: self.watches.len() as u64,
            checker_tasks: self.tasks.len() as u64,
            mounts: self.mounts.len() as u64,
            objects: self.store.object_count()?,
        })
    }

    // ========================================================================
    // Queries and attributes
    // ========================================================================

    async fn query(&mut self, query: &Query) -> IndexResult<Vec<Object>> {
        let compiled = QueryEngine::compile(self.store.schema(), query)?;
        if let Some(dir) = query.dirname_anchor() {
            self.reconcile(dir).await?;
        }
        self.store.execute(&compiled)
    }

    fn set_attribute(&mut self, key: &ObjectKey, attr: &str, value: Option<AttrValue>) -> IndexResult<Object> {
        if is_pseudo(attr) {
            return Err(IndexError::invalid_request(format!("`{attr}` is computed and cannot be set")));
        }
        let mut object = self.store.get(key)?;
        let Some(spec) = self.store.schema().spec(&key.object_type, attr) else {
            return Err(IndexError::invalid_request(format!(
                "`{attr}` is not declared for type `{}`",
                key.object_type
            )));
        };
        match value {
            Some(value) if value.kind() != spec.kind => {
                return Err(IndexError::invalid_request(format!(
                    "`{attr}` holds {} values, got {}",
                    spec.kind,
                    value.kind()
                )));
            }
            Some(value) => {
                object.attributes.insert(attr.to_string(), value);
            }
            None => {
                object.attributes.remove(attr);
            }
        }
        let object = self.store.put(&object)?;
        tracing::debug!(key = %key, attr, revision = object.revision, "attribute set");
        self.refresh_idle(None)?;
        Ok(object)
    }

    // ========================================================================
    // Directory reconciliation
    // ========================================================================

    /// The directory object at `dir`, creating it and any missing ancestors
    /// below the covering mount. `None` if no mount covers `dir` or it is
    /// not a directory on disk.
    async fn ensure_dir(&mut self, dir: &Path) -> IndexResult<Option<Object>> {
        let dir = MountTable::normalize(dir);
        let Some(mount) = self.mounts.find(&dir).cloned() else {
            return Ok(None);
        };
        let volume = mount.volume_id;
        let Some(mut current) = self.store.find_by_path(&volume, &mount.mount_path)? else {
            return Ok(None);
        };
        let Ok(relative) = dir.strip_prefix(&mount.mount_path) else {
            return Ok(None);
        };
        let relative = relative.to_path_buf();

        let mut path = mount.mount_path;
        for part in relative.components() {
            path.push(part);
            match self.store.find_by_path(&volume, &path)? {
                Some(obj) if obj.key.object_type == TYPE_DIR => current = obj,
                Some(_) => return Ok(None),
                None => {
                    let is_dir = tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir());
                    if !is_dir {
                        return Ok(None);
                    }
                    let new = NewObject::new(TYPE_DIR, path.clone(), volume.clone()).with_parent(current.key.clone());
                    current = self.store.insert(new)?;
                }
            }
        }
        Ok(Some(current))
    }

    /// Bring the children of `dir` in line with its listing on disk.
    ///
    /// New entries are inserted with no mtime (so the checker parses them).
    /// Entries missing from the listing are removed once they have been
    /// missing for the configured grace window; until then a rescan is
    /// scheduled. A listing that fails is treated as a transient stall and
    /// removes nothing.
    async fn reconcile(&mut self, dir: &Path) -> IndexResult<Option<Object>> {
        let Some(dir_obj) = self.ensure_dir(dir).await? else {
            return Ok(None);
        };
        let listing = match read_listing(&dir_obj.path).await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::debug!(dir = %dir_obj.path.display(), error = %e, "listing failed, keeping children");
                return Ok(Some(dir_obj));
            }
        };
        let volume = dir_obj.volume.clone().unwrap_or_default();

        let mut known: HashMap<PathBuf, Object> = self
            .store
            .all_children_of(&dir_obj.key)?
            .into_iter()
            .map(|o| (o.path.clone(), o))
            .collect();

        for (pos, entry) in listing.into_iter().enumerate() {
            let pos = pos as i64;
            if let Some(obj) = known.remove(&entry.path) {
                self.missing.remove(&obj.key);
                self.store.set_scan_pos(&obj.key, pos)?;
                continue;
            }
            let object_type = classify_path(&entry.path, entry.is_dir);
            let new = NewObject::new(object_type, entry.path.clone(), volume.clone())
                .with_parent(dir_obj.key.clone())
                .at_position(pos);
            match self.store.insert(new) {
                Ok(obj) => tracing::debug!(key = %obj.key, path = %obj.path.display(), "discovered"),
                Err(e) => tracing::warn!(path = %entry.path.display(), error = %e, "could not record new entry"),
            }
        }

        let grace = self.config.deletion_grace();
        let now = Instant::now();
        let mut recheck: Option<Duration> = None;
        for gone in known.into_values() {
            let since = self
                .missing
                .entry(gone.key.clone())
                .or_insert_with(|| Missing {
                    volume: volume.clone(),
                    since: now,
                })
                .since;
            let waited = now.duration_since(since);
            if waited < grace {
                let left = grace - waited;
                recheck = Some(recheck.map_or(left, |d| d.min(left)));
                continue;
            }
            let removed = self.store.remove_subtree(&gone.key)?;
            for key in &removed {
                self.missing.remove(key);
            }
            tracing::debug!(path = %gone.path.display(), removed = removed.len(), "vanished path removed");
        }
        if let Some(delay) = recheck {
            self.schedule_rescan(dir_obj.path.clone(), delay);
        }
        Ok(Some(dir_obj))
    }

    fn schedule_rescan(&self, dir: PathBuf, delay: Duration) {
        let tx = self.rescan_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(dir);
        });
    }

    /// Re-list `dir`: through its monitors if any watch it, directly otherwise.
    async fn rescan(&mut self, dir: &Path) -> IndexResult<()> {
        let dir = MountTable::normalize(dir);
        if self.monitors.values().any(|m| m.watched().contains(&dir)) {
            self.trigger_dir(&dir).await;
            return Ok(());
        }
        self.reconcile(&dir).await?;
        self.refresh_idle(None)
    }

    // ========================================================================
    // Monitors
    // ========================================================================

    async fn monitor(&mut self, client: ClientId, query: Query, sink: EventSink) -> IndexResult<Subscription> {
        if let Some(existing) = self
            .monitors
            .values()
            .find(|m| m.client() == client && m.query().query() == &query)
        {
            return Ok(Subscription {
                id: existing.id(),
                state: existing.state(),
                objects: existing.keys(),
            });
        }

        let compiled = QueryEngine::compile(self.store.schema(), &query)?;
        let initial = self.store.execute(&compiled)?;
        self.next_subscription += 1;
        let id = SubscriptionId::new(self.next_subscription);

        let monitor = Monitor::new(id, client, compiled, &initial);
        monitor.bus().subscribe(move |event| {
            let _ = sink.send((id, event.clone()));
        });
        self.monitors.insert(id, monitor);
        tracing::debug!(subscription = %id, client = %client, objects = initial.len(), "monitor created");

        self.begin_cycle(id).await;
        let state = self
            .monitors
            .get(&id)
            .map(Monitor::state)
            .unwrap_or(MonitorState::Stopped);
        Ok(Subscription {
            id,
            state,
            objects: initial.into_iter().map(|o| o.key).collect(),
        })
    }

    fn stop_owned(&mut self, client: ClientId, id: SubscriptionId) -> IndexResult<bool> {
        if let Some(monitor) = self.monitors.get(&id)
            && monitor.client() != client
        {
            tracing::debug!(subscription = %id, client = %client, owner = %monitor.client(), "stop refused");
            return Err(IndexError::not_found(format!("subscription {id}")));
        }
        Ok(self.stop_monitor(id))
    }

    fn stop_monitor(&mut self, id: SubscriptionId) -> bool {
        let Some(mut monitor) = self.monitors.remove(&id) else {
            return false;
        };
        let (task, dirs) = monitor.stop();
        if let Some(task) = task {
            self.tasks.remove(&task);
        }
        for dir in &dirs {
            self.watches.unwatch(dir);
        }
        true
    }

    fn release_client(&mut self, client: ClientId) -> usize {
        let ids: Vec<SubscriptionId> = self
            .monitors
            .values()
            .filter(|m| m.client() == client)
            .map(Monitor::id)
            .collect();
        for id in &ids {
            self.stop_monitor(*id);
        }
        if !ids.is_empty() {
            tracing::debug!(client = %client, monitors = ids.len(), "client released");
        }
        ids.len()
    }

    /// Start a scan cycle. Errors end the cycle with whatever was observed.
    async fn begin_cycle(&mut self, id: SubscriptionId) {
        let Some(monitor) = self.monitors.get_mut(&id) else {
            return;
        };
        monitor.begin_scan();
        if let Err(e) = self.start_round(id).await {
            tracing::warn!(subscription = %id, error = %e, "scan round failed");
            self.finish_logged(id);
        }
    }

    /// One round: reconcile the monitor's directories, refresh its watches,
    /// and hand its current results to the checker.
    async fn start_round(&mut self, id: SubscriptionId) -> IndexResult<()> {
        let Some(monitor) = self.monitors.get(&id) else {
            return Ok(());
        };
        let anchor = monitor.query().query().dirname_anchor().map(Path::to_path_buf);
        let dirs: BTreeSet<PathBuf> = match anchor {
            Some(dir) => BTreeSet::from([dir]),
            None => self
                .store
                .execute(monitor.query())?
                .iter()
                .filter_map(|o| o.path.parent().map(Path::to_path_buf))
                .collect(),
        };

        let mut watch = BTreeSet::new();
        for dir in &dirs {
            if let Some(dir_obj) = self.reconcile(dir).await? {
                watch.insert(dir_obj.path);
            }
        }

        let Some(monitor) = self.monitors.get_mut(&id) else {
            return Ok(());
        };
        let current = self.store.execute(monitor.query())?;
        let (add, drop) = monitor.rewatch(watch);
        for dir in &add {
            self.watches.watch(dir);
        }
        for dir in &drop {
            self.watches.unwatch(dir);
        }

        let items = current
            .into_iter()
            .map(|o| CheckItem {
                key: o.key,
                path: o.path,
                recorded_mtime: o.mtime,
            })
            .collect();
        let task = self.checker.spawn(items, self.checker_tx.clone());
        self.tasks.insert(task.id(), id);
        monitor.bind_checker(task);
        Ok(())
    }

    fn finish(&mut self, id: SubscriptionId) -> IndexResult<()> {
        let Some(monitor) = self.monitors.get_mut(&id) else {
            return Ok(());
        };
        let current = self.store.execute(monitor.query())?;
        monitor.complete(&current);
        self.refresh_idle(Some(id))
    }

    fn finish_logged(&mut self, id: SubscriptionId) {
        if let Err(e) = self.finish(id) {
            tracing::warn!(subscription = %id, error = %e, "could not complete scan");
        }
    }

    /// Let idle monitors (other than `except`) see out-of-cycle changes.
    fn refresh_idle(&mut self, except: Option<SubscriptionId>) -> IndexResult<()> {
        for (id, monitor) in self.monitors.iter_mut() {
            if Some(*id) == except || monitor.state() != MonitorState::Idle {
                continue;
            }
            let current = self.store.execute(monitor.query())?;
            monitor.refresh(&current);
        }
        Ok(())
    }

    /// A watched directory changed: idle monitors rescan, scanning ones
    /// run one more round before settling.
    async fn trigger(&mut self, id: SubscriptionId) {
        let Some(monitor) = self.monitors.get_mut(&id) else {
            return;
        };
        match monitor.state() {
            MonitorState::Scanning => monitor.request_rescan(),
            MonitorState::Initial | MonitorState::Idle => self.begin_cycle(id).await,
            MonitorState::Stopped => {}
        }
    }

    async fn trigger_dir(&mut self, dir: &Path) {
        let ids: Vec<SubscriptionId> = self
            .monitors
            .values()
            .filter(|m| m.watched().contains(dir))
            .map(Monitor::id)
            .collect();
        for id in ids {
            self.trigger(id).await;
        }
    }

    async fn on_fs_event(&mut self, event: FsEvent) {
        let Some(dir) = event.dir().map(Path::to_path_buf) else {
            return;
        };
        tracing::trace!(kind = %event.kind, path = %event.path.display(), "filesystem change");
        self.trigger_dir(&dir).await;
    }

    async fn on_checker_event(&mut self, event: CheckerEvent) {
        let Some(&id) = self.tasks.get(&event.task()) else {
            return;
        };
        match event {
            CheckerEvent::Parsed { key, outcome, .. } => {
                if let Err(e) = self.apply_parse(&key, outcome) {
                    tracing::warn!(key = %key, error = %e, "could not record parse result");
                }
            }
            CheckerEvent::Progress { done, total, .. } => {
                if let Some(monitor) = self.monitors.get(&id) {
                    monitor.deliver(MonitorEvent::Progress { done, total });
                }
            }
            CheckerEvent::Completed { task, reparsed, cancelled } => {
                self.tasks.remove(&task);
                if cancelled {
                    return;
                }
                let Some(monitor) = self.monitors.get_mut(&id) else {
                    return;
                };
                monitor.release_checker();
                let again = (reparsed > 0 || monitor.pending_rescan())
                    && monitor.rounds() < self.config.max_rechecks;
                if !again {
                    self.finish_logged(id);
                } else if let Err(e) = self.start_round(id).await {
                    tracing::warn!(subscription = %id, error = %e, "re-check round failed");
                    self.finish_logged(id);
                }
            }
        }
    }

    /// Merge a re-parse into the stored object. Parsed attributes overwrite
    /// same-named ones; attributes the parser did not produce are kept.
    fn apply_parse(&mut self, key: &ObjectKey, outcome: ParseOutcome) -> IndexResult<()> {
        let Some(mut object) = self.store.try_get(key)? else {
            return Ok(());
        };
        match outcome {
            ParseOutcome::Parsed { mtime, attributes } => {
                object.attributes.extend(attributes);
                object.mtime = mtime;
                object.state = ObjectState::Ok;
            }
            ParseOutcome::Failed { mtime, .. } => {
                object.mtime = mtime;
                object.state = ObjectState::Unparseable;
            }
        }
        self.store.put(&object)?;
        Ok(())
    }

    // ========================================================================
    // Mountpoints
    // ========================================================================

    async fn add_mountpoint(&mut self, mut mountpoint: Mountpoint) -> IndexResult<Object> {
        mountpoint.mount_path = MountTable::normalize(&mountpoint.mount_path);
        let path = mountpoint.mount_path.clone();
        let volume = mountpoint.volume_id.clone();

        if let Some(existing) = self.mounts.get(&path) {
            if existing.volume_id == volume {
                return self
                    .store
                    .find_root(&volume)?
                    .ok_or_else(|| IndexError::not_found(format!("root of volume {volume}")));
            }
            self.remove_mountpoint(&path)?;
        }
        if let Some(elsewhere) = self.mounts.by_volume(&volume).map(|m| m.mount_path.clone()) {
            self.remove_mountpoint(&elsewhere)?;
        }

        let root = match self.store.find_root(&volume)? {
            Some(root) if root.path != path => {
                let moved = self.store.relocate_volume(&volume, &root.path, &path)?;
                tracing::info!(
                    volume = %volume,
                    from = %root.path.display(),
                    to = %path.display(),
                    objects = moved,
                    "volume relocated"
                );
                root
            }
            Some(root) => root,
            None => self.store.insert(NewObject::new(TYPE_DIR, path.clone(), volume.clone()))?,
        };
        let restored = self.store.mark_volume_reachable(&volume, true)?;
        tracing::info!(
            path = %path.display(),
            volume = %volume,
            kind = %mountpoint.kind,
            objects = restored,
            "mountpoint attached"
        );
        self.mounts.attach(mountpoint);
        self.reconcile(&path).await?;

        let affected: Vec<SubscriptionId> = self
            .monitors
            .values()
            .filter(|m| monitor_under(m, &path))
            .map(Monitor::id)
            .collect();
        for id in affected {
            self.trigger(id).await;
        }
        self.refresh_idle(None)?;
        self.store.get(&root.key)
    }

    fn remove_mountpoint(&mut self, mount_path: &Path) -> IndexResult<Option<Mountpoint>> {
        let Some(mountpoint) = self.mounts.detach(mount_path) else {
            return Ok(None);
        };
        let detached = self.store.mark_volume_reachable(&mountpoint.volume_id, false)?;
        self.missing.retain(|_, m| m.volume != mountpoint.volume_id);
        tracing::info!(
            path = %mountpoint.mount_path.display(),
            volume = %mountpoint.volume_id,
            objects = detached,
            "mountpoint detached"
        );

        for monitor in self.monitors.values_mut() {
            if !monitor_under(monitor, &mountpoint.mount_path) {
                continue;
            }
            for dir in monitor.unwatch_under(&mountpoint.mount_path) {
                self.watches.unwatch(&dir);
            }
            let current = self.store.execute(monitor.query())?;
            match monitor.state() {
                MonitorState::Scanning => {
                    if let Some(task) = monitor.abort_scan(&current) {
                        self.tasks.remove(&task);
                    }
                }
                _ => {
                    monitor.refresh(&current);
                }
            }
        }
        self.refresh_idle(None)?;
        Ok(Some(mountpoint))
    }
}

/// Whether a monitor's anchor or watches fall under `prefix`.
fn monitor_under(monitor: &Monitor, prefix: &Path) -> bool {
    let anchored = monitor
        .query()
        .query()
        .dirname_anchor()
        .is_some_and(|dir| dir.starts_with(prefix));
    anchored || monitor.watched().iter().any(|dir| dir.starts_with(prefix))
}

struct ListingEntry {
    path: PathBuf,
    is_dir: bool,
}

/// Visible entries of `dir`, sorted by path. Entries that cannot be stat'ed
/// (dangling links) are left out.
async fn read_listing(dir: &Path) -> std::io::Result<Vec<ListingEntry>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        entries.push(ListingEntry {
            path,
            is_dir: meta.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
