//! Serializable request/response envelope for the driver's operations.
//!
//! [`CsiMessage`] lets a transport carry any lifecycle call as one JSON
//! value; [`StorageDriver::dispatch`](crate::driver::StorageDriver::dispatch)
//! turns a request variant into the matching response variant.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// A caller sends one *request* variant and receives the corresponding
/// *response* variant, or [`CsiMessage::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Create a new volume (Controller).
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume (Controller).
    DeleteVolume(DeleteVolumeRequest),
    /// Validate volume capabilities (Controller).
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    /// Grow a volume (Controller, always unimplemented).
    ControllerExpandVolume(ControllerExpandVolumeRequest),

    /// Mount a volume at its staging path (Node).
    StageVolume(NodeStageVolumeRequest),
    /// Unmount a staged volume (Node).
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },

    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    // ----- Responses -------------------------------------------------------
    /// A volume was successfully created.
    VolumeCreated(Volume),
    /// Result of a capability check.
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    /// Capacity after expansion.
    VolumeExpanded(u64),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// `true` for variants a caller may send.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::CreateVolume(_)
                | Self::DeleteVolume(_)
                | Self::ValidateVolumeCapabilities(_)
                | Self::ControllerExpandVolume(_)
                | Self::StageVolume(_)
                | Self::UnstageVolume { .. }
                | Self::Probe
                | Self::GetPluginInfo
                | Self::GetPluginCapabilities
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ControllerExpandVolume(req) => {
                write!(f, "ControllerExpandVolume({})", req.volume_id)
            }
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::CapabilitiesValidated(resp) => {
                write!(f, "CapabilitiesValidated(confirmed={})", resp.is_confirmed())
            }
            Self::VolumeExpanded(bytes) => write!(f, "VolumeExpanded({bytes})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
