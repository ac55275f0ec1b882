//! Where device changes are reported.

use std::path::Path;

use async_trait::async_trait;
use trove_client::Session;
use trove_types::Mountpoint;

use crate::error::HotplugResult;

/// Receiver of hotplug notifications.
#[async_trait]
pub trait HotplugSink: Send + Sync {
    async fn device_added(&self, mountpoint: Mountpoint) -> HotplugResult<()>;
    async fn device_removed(&self, mount_path: &Path) -> HotplugResult<()>;
}

#[async_trait]
impl HotplugSink for Session {
    async fn device_added(&self, mountpoint: Mountpoint) -> HotplugResult<()> {
        self.add_mountpoint(mountpoint).await?;
        Ok(())
    }

    async fn device_removed(&self, mount_path: &Path) -> HotplugResult<()> {
        self.remove_mountpoint(mount_path).await?;
        Ok(())
    }
}
