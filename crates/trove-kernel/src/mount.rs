//! Mount table with longest-prefix routing.
//!
//! Maps paths to the attached [`Mountpoint`] that covers them. Mount points
//! are matched by longest prefix: with `/media` and `/media/usb` both
//! attached, `/media/usb/music/a.mp3` routes to `/media/usb`.
//!
//! The table is owned by the index actor, so it needs no locking of its own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use trove_types::{Mountpoint, normalize_path};

/// Attached mountpoints, keyed by normalized mount path.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: BTreeMap<PathBuf, Mountpoint>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a mount path: absolute, no trailing slash, no `.` parts.
    pub fn normalize(path: &Path) -> PathBuf {
        normalize_path(path)
    }

    /// Attach a mountpoint, replacing whatever was attached at its path.
    ///
    /// Returns the replaced mountpoint, if any.
    pub fn attach(&mut self, mut mountpoint: Mountpoint) -> Option<Mountpoint> {
        let path = Self::normalize(&mountpoint.mount_path);
        mountpoint.mount_path = path.clone();
        self.mounts.insert(path, mountpoint)
    }

    /// Detach the mountpoint at `path`.
    pub fn detach(&mut self, path: &Path) -> Option<Mountpoint> {
        self.mounts.remove(&Self::normalize(path))
    }

    /// The mountpoint attached exactly at `path`.
    pub fn get(&self, path: &Path) -> Option<&Mountpoint> {
        self.mounts.get(&Self::normalize(path))
    }

    /// The attached mountpoint for a volume id.
    pub fn by_volume(&self, volume_id: &str) -> Option<&Mountpoint> {
        self.mounts.values().find(|m| m.volume_id == volume_id)
    }

    /// Longest-prefix lookup: the mountpoint covering `path`.
    pub fn find(&self, path: &Path) -> Option<&Mountpoint> {
        let path = Self::normalize(path);
        self.mounts
            .iter()
            .filter(|(mount_path, _)| path.starts_with(mount_path))
            .max_by_key(|(mount_path, _)| mount_path.components().count())
            .map(|(_, m)| m)
    }

    /// Every attached mountpoint, ordered by mount path.
    pub fn list(&self) -> Vec<Mountpoint> {
        self.mounts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_types::MountKind;

    fn mp(path: &str, volume: &str) -> Mountpoint {
        Mountpoint::new(MountKind::Removable, "/dev/sdb1", path, Some(volume.to_string()))
    }

    #[test]
    fn normalize_strips_trailing_slash_and_dots() {
        assert_eq!(MountTable::normalize(Path::new("/media/usb/")), PathBuf::from("/media/usb"));
        assert_eq!(MountTable::normalize(Path::new("/media/./usb/../cd")), PathBuf::from("/media/cd"));
        assert_eq!(MountTable::normalize(Path::new("")), PathBuf::from("/"));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = MountTable::new();
        table.attach(mp("/media", "outer"));
        table.attach(mp("/media/usb", "inner"));

        let hit = table.find(Path::new("/media/usb/music/a.mp3")).unwrap();
        assert_eq!(hit.volume_id, "inner");
        let hit = table.find(Path::new("/media/other")).unwrap();
        assert_eq!(hit.volume_id, "outer");
        assert!(table.find(Path::new("/home/x")).is_none());
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let mut table = MountTable::new();
        table.attach(mp("/media/usb", "v"));
        assert!(table.find(Path::new("/media/usb2/a")).is_none());
        assert!(table.find(Path::new("/media/usb")).is_some());
    }

    #[test]
    fn attach_replaces_and_detach_removes() {
        let mut table = MountTable::new();
        assert!(table.attach(mp("/media/usb/", "one")).is_none());
        let old = table.attach(mp("/media/usb", "two")).unwrap();
        assert_eq!(old.volume_id, "one");
        assert_eq!(table.len(), 1);
        assert_eq!(table.by_volume("two").unwrap().mount_path, PathBuf::from("/media/usb"));

        assert!(table.detach(Path::new("/media/usb")).is_some());
        assert!(table.detach(Path::new("/media/usb")).is_none());
        assert!(table.is_empty());
    }
}
