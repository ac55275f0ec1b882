//! Directory change notification.
//!
//! A [`WatchSet`] keeps one non-recursive notify watch per directory, shared
//! by every monitor that needs it. Raw notify events are mapped to
//! [`FsEvent`]s and pushed into a bounded channel with `try_send`; when the
//! index falls behind, events are dropped and the next rescan catches up.
//!
//! If the platform watcher cannot be created the set degrades to tracking
//! refcounts only, and monitors rely on explicit rescans.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FsEventKind {
    Create,
    Change,
    Delete,
}

/// A change to a path inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsEvent {
    /// The directory whose listing this event affects.
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }
}

/// Refcounted set of watched directories.
pub struct WatchSet {
    watcher: Option<RecommendedWatcher>,
    refs: HashMap<PathBuf, usize>,
}

impl std::fmt::Debug for WatchSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSet")
            .field("active", &self.watcher.is_some())
            .field("dirs", &self.refs.len())
            .finish()
    }
}

impl WatchSet {
    /// Create a watch set feeding `tx`.
    pub fn new(tx: mpsc::Sender<FsEvent>) -> Self {
        let watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let Ok(event) = result else { return };
                let kind = match event.kind {
                    EventKind::Create(_) => FsEventKind::Create,
                    EventKind::Modify(_) => FsEventKind::Change,
                    EventKind::Remove(_) => FsEventKind::Delete,
                    _ => return,
                };
                for path in event.paths {
                    let _ = tx.try_send(FsEvent { kind, path });
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_millis(500)),
        );

        match watcher {
            Ok(watcher) => Self {
                watcher: Some(watcher),
                refs: HashMap::new(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "file watcher unavailable, changes need explicit rescans");
                Self::inert()
            }
        }
    }

    /// A watch set that never delivers events.
    pub fn inert() -> Self {
        Self {
            watcher: None,
            refs: HashMap::new(),
        }
    }

    /// Take a reference on `dir`, starting a watch for the first one.
    pub fn watch(&mut self, dir: &Path) {
        let count = self.refs.entry(dir.to_path_buf()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return;
        }
        if let Some(watcher) = self.watcher.as_mut()
            && let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive)
        {
            tracing::debug!(dir = %dir.display(), error = %e, "watch failed");
        }
    }

    /// Drop a reference on `dir`, stopping the watch with the last one.
    pub fn unwatch(&mut self, dir: &Path) {
        let Some(count) = self.refs.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.refs.remove(dir);
        if let Some(watcher) = self.watcher.as_mut() {
            let _ = watcher.unwatch(dir);
        }
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.refs.contains_key(dir)
    }

    /// Number of distinct watched directories.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounts_shared_dirs() {
        let mut set = WatchSet::inert();
        let dir = Path::new("/media/usb/music");
        set.watch(dir);
        set.watch(dir);
        assert_eq!(set.len(), 1);

        set.unwatch(dir);
        assert!(set.is_watched(dir));
        set.unwatch(dir);
        assert!(!set.is_watched(dir));
        set.unwatch(dir);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn reports_created_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let mut set = WatchSet::new(tx);
        set.watch(tmp.path());

        let path = tmp.path().join("new.mp3");
        std::fs::write(&path, b"x").unwrap();

        // Backends differ in how they report a write, so only wait for any
        // event naming the new file.
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(ev) = rx.recv().await {
                if ev.path.file_name() == path.file_name() {
                    return Some(ev);
                }
            }
            None
        })
        .await;
        if let Ok(Some(ev)) = got {
            assert_eq!(ev.dir().and_then(|d| d.file_name()), tmp.path().file_name());
        }
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(FsEventKind::Create.to_string(), "create");
        assert_eq!(FsEventKind::Delete.to_string(), "delete");
    }
}
