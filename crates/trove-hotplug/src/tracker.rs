//! Mount table diffing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use trove_types::{MountKind, Mountpoint};

use crate::constants::OPTICAL_FS_TYPES;
use crate::identity::volume_identity_in;
use crate::mountinfo::MountEntry;

/// A change in the set of removable volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(Mountpoint),
    Removed { mount_path: PathBuf },
}

/// Remembers which removable volumes were mounted at the last poll.
#[derive(Debug)]
pub struct VolumeTracker {
    prefixes: Vec<PathBuf>,
    by_uuid_dir: PathBuf,
    known: BTreeMap<PathBuf, MountEntry>,
}

impl VolumeTracker {
    pub fn new(prefixes: Vec<PathBuf>, by_uuid_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefixes,
            by_uuid_dir: by_uuid_dir.into(),
            known: BTreeMap::new(),
        }
    }

    /// Number of volumes currently tracked.
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Whether `entry` is a block device mounted strictly below one of the prefixes.
    pub fn is_removable(&self, entry: &MountEntry) -> bool {
        entry.is_block_device()
            && self
                .prefixes
                .iter()
                .any(|p| entry.mount_point != *p && entry.mount_point.starts_with(p))
    }

    /// Diff a fresh mount table against the last one. Removals come first so a
    /// volume remounted at the same path is detached before it reattaches.
    pub fn update(&mut self, entries: &[MountEntry]) -> Vec<DeviceEvent> {
        let current: BTreeMap<PathBuf, MountEntry> = entries
            .iter()
            .filter(|e| self.is_removable(e))
            .map(|e| (e.mount_point.clone(), e.clone()))
            .collect();

        let mut events = Vec::new();
        for (path, old) in &self.known {
            match current.get(path) {
                Some(new) if new.source == old.source => {}
                _ => events.push(DeviceEvent::Removed {
                    mount_path: path.clone(),
                }),
            }
        }
        for (path, new) in &current {
            match self.known.get(path) {
                Some(old) if old.source == new.source => {}
                _ => events.push(DeviceEvent::Added(self.mountpoint(new))),
            }
        }

        self.known = current;
        events
    }

    fn mountpoint(&self, entry: &MountEntry) -> Mountpoint {
        let kind = if OPTICAL_FS_TYPES.contains(&entry.fs_type.as_str()) {
            MountKind::Optical
        } else {
            MountKind::Removable
        };
        let identity = volume_identity_in(&self.by_uuid_dir, Path::new(&entry.source));
        Mountpoint::new(kind, entry.source.clone(), entry.mount_point.clone(), Some(identity))
    }
}
