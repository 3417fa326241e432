//! Pluggable storage backend implementations.
//!
//! Every backend implements the four-operation [`Storage`] contract against
//! one storage technology and registers itself in a
//! [`BackendRegistry`](crate::registry::BackendRegistry) under a distinct
//! name.  Backends talk to their service through a narrow client trait
//! ([`ObjectStore`], [`RemoteFs`]) so the service can be swapped for the
//! in-memory implementations in `memory` (built for tests and with the
//! `testing` feature).

#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod object_store;
pub mod remote_fs;
pub mod s3;
pub mod sftp;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{CreateVolumeRequest, VolumeId};

pub use object_store::ObjectStore;
pub use remote_fs::RemoteFs;

/// Lifecycle contract implemented once per storage technology.
///
/// Backends keep no state between calls: everything an operation needs is
/// derived from the volume identifier, the backend's configuration, and (for
/// mounting) the volume context.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Provision the container (or root directory) for a new volume.
    ///
    /// Calling this again with the same request succeeds and returns the
    /// same identifier.
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<VolumeId, CsiError>;

    /// Remove a volume's data.  Deleting a missing volume succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Check that the volume's backing storage exists.
    ///
    /// Fails with [`CsiError::VolumeNotFound`] when it does not; access-mode
    /// matching is left to the caller.
    async fn validate_volume_capabilities(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Mount the volume at `staging_target_path` through the mount bridge.
    ///
    /// Returns once the bridge has detached into the background.
    async fn mount_stage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), CsiError>;
}
