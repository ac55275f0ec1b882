//! Hotplug constants.

use std::time::Duration;

/// How often the mount table is re-read.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Kernel mount table of the current mount namespace.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// udev's filesystem-UUID symlink directory.
pub const BY_UUID_DIR: &str = "/dev/disk/by-uuid";

/// Mount prefixes under which new mounts count as removable volumes.
pub const DEFAULT_PREFIXES: &[&str] = &["/media", "/run/media", "/mnt"];

/// Filesystem types reported as optical media.
pub const OPTICAL_FS_TYPES: &[&str] = &["iso9660", "udf"];
