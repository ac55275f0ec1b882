//! Removable-volume watcher.
//!
//! Polls the kernel mount table, diffs it against the previous poll, and
//! reports block devices mounted below the configured prefixes to a trove
//! server as `Removable` or `Optical` mountpoints. Unmounts are reported as
//! mountpoint removals.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

pub mod constants;
pub mod error;
pub mod identity;
pub mod mountinfo;
pub mod sink;
pub mod tracker;

pub use error::{HotplugError, HotplugResult};
pub use mountinfo::{MountEntry, parse_mountinfo};
pub use sink::HotplugSink;
pub use tracker::{DeviceEvent, VolumeTracker};

use constants::{BY_UUID_DIR, DEFAULT_PREFIXES, MOUNTINFO_PATH, POLL_INTERVAL};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mountinfo_path: PathBuf,
    pub by_uuid_dir: PathBuf,
    pub prefixes: Vec<PathBuf>,
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mountinfo_path: PathBuf::from(MOUNTINFO_PATH),
            by_uuid_dir: PathBuf::from(BY_UUID_DIR),
            prefixes: DEFAULT_PREFIXES.iter().map(PathBuf::from).collect(),
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl MonitorConfig {
    pub fn tracker(&self) -> VolumeTracker {
        VolumeTracker::new(self.prefixes.clone(), self.by_uuid_dir.clone())
    }
}

/// Read the mount table once and report what changed since the last call.
///
/// A report the sink rejects is logged and skipped; the tracker has already
/// moved on, so the volume is not retried until it changes again.
pub async fn poll_once(
    sink: &dyn HotplugSink,
    tracker: &mut VolumeTracker,
    config: &MonitorConfig,
) -> HotplugResult<Vec<DeviceEvent>> {
    let text = tokio::fs::read_to_string(&config.mountinfo_path).await?;
    let entries = parse_mountinfo(&text)?;
    let events = tracker.update(&entries);

    for event in &events {
        let result = match event {
            DeviceEvent::Added(mountpoint) => {
                tracing::info!(
                    device = %mountpoint.device_path,
                    mount_path = %mountpoint.mount_path.display(),
                    kind = %mountpoint.kind,
                    volume = %mountpoint.volume_id,
                    "volume mounted"
                );
                sink.device_added(mountpoint.clone()).await
            }
            DeviceEvent::Removed { mount_path } => {
                tracing::info!(mount_path = %mount_path.display(), "volume unmounted");
                sink.device_removed(mount_path).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, ?event, "hotplug report failed");
        }
    }
    Ok(events)
}

/// Poll until `shutdown` resolves. Volumes already mounted at startup are
/// reported on the first poll. A connection loss to the server ends the loop.
pub async fn run_monitor(
    sink: &dyn HotplugSink,
    config: MonitorConfig,
    shutdown: impl std::future::Future<Output = ()>,
) -> HotplugResult<()> {
    let mut tracker = config.tracker();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("hotplug monitor stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                match poll_once(sink, &mut tracker, &config).await {
                    Ok(_) => {}
                    Err(e @ HotplugError::Mountinfo { .. }) => {
                        tracing::warn!(error = %e, "skipping unreadable mount table");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
