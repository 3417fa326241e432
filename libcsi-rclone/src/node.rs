//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a volume available
//! locally:
//!
//! 1. **Stage**: mount the remote storage at a global path through rclone.
//! 2. **Unstage**: unmount it again.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{NodeStageVolumeRequest, VolumeId};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its global staging path.
    ///
    /// Idempotent: calling it again for an already-staged volume
    /// should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the bridge from the staging path.
    ///
    /// Idempotent: calling it on an already-unstaged volume should
    /// succeed without error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;
}
