//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation,
//! deletion and capability validation.  Expansion is part of the surface but
//! rejected by this driver.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerExpandVolumeRequest, CreateVolumeRequest, DeleteVolumeRequest,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and the
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting a volume that does
    /// not exist succeeds.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    ///
    /// Unsupported capabilities produce a non-confirming response, not an
    /// error.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// Grow a volume.
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<u64, CsiError>;
}
