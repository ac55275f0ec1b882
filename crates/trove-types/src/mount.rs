//! Mountpoints: logical roots mapped onto physical path prefixes.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What kind of storage backs a mountpoint.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MountKind {
    /// Fixed local storage configured at startup.
    #[default]
    Local,
    /// Hotplugged removable volume (USB stick, SD card, ...).
    Removable,
    /// Optical media.
    Optical,
}

/// A mounted root.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mountpoint {
    pub kind: MountKind,
    /// Block device path (`/dev/sdb1`), or empty for local roots.
    pub device_path: String,
    /// Where the volume is mounted.
    pub mount_path: PathBuf,
    /// Stable volume identity. Reattaching the same volume reconciles
    /// against the historical subtree recorded under this identity.
    pub volume_id: String,
}

impl Mountpoint {
    /// Build a mountpoint; without an explicit identity the device path stands in.
    pub fn new(
        kind: MountKind,
        device_path: impl Into<String>,
        mount_path: impl Into<PathBuf>,
        volume_id: Option<String>,
    ) -> Self {
        let device_path = device_path.into();
        let mount_path = mount_path.into();
        let volume_id = volume_id
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| {
                if device_path.is_empty() {
                    mount_path.to_string_lossy().into_owned()
                } else {
                    device_path.clone()
                }
            });
        Self {
            kind,
            device_path,
            mount_path,
            volume_id,
        }
    }
}

/// Lexically normalize a path: absolute, no trailing slash, no `.` parts,
/// `..` folded into its parent. Paths are compared in this form everywhere
/// (mount table, directory anchors, stored object paths).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}
