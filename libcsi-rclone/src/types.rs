//! Core CSI types: volumes, capabilities and lifecycle requests.
//!
//! These types form the data model shared by the CSI traits, the message
//! envelope, and the storage backends.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be carried as JSON by whatever
//! transport embeds this crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, canonical identifier for a volume.
///
/// The string alone is enough to locate the volume's storage: see
/// [`crate::volume_id`] for the `<container>/<prefix>` encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `true` if the identifier is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-write on a single node.
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Read-only on many nodes, read-write on at most one.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    pub fn new(access_mode: AccessMode) -> Self {
        Self { access_mode }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::new(AccessMode::MultiNodeMultiWriter)
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// A provisioned volume as returned by `CreateVolume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Canonical volume identifier.
    pub volume_id: VolumeId,
    /// Declared capacity in bytes.
    pub capacity_bytes: u64,
    /// Opaque context passed verbatim to every later node operation.
    ///
    /// Nothing else is persisted, so this map must carry every fact needed
    /// to mount the volume later.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Proposed name for the volume.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Per-request parameters, overlaid on the driver's static configuration.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Backend selection and credentials.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Request to delete a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    /// Volume to delete.
    pub volume_id: VolumeId,
    /// Backend selection and credentials.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Request to check whether a volume supports a set of capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    /// Volume to validate.
    pub volume_id: VolumeId,
    /// Capabilities the caller intends to use.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Backend selection and credentials.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Answer to a [`ValidateVolumeCapabilitiesRequest`].
///
/// Exactly one of `confirmed` (every requested capability is supported) or
/// a non-empty `message` (the reason for rejection) is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// Capabilities the driver confirms, when all requested ones match.
    #[serde(default)]
    pub confirmed: Option<Vec<VolumeCapability>>,
    /// Rejection message when the capabilities are not supported.
    #[serde(default)]
    pub message: String,
}

impl ValidateVolumeCapabilitiesResponse {
    /// `true` if the driver confirmed the requested capabilities.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed.is_some()
    }
}

/// Request to grow a volume.  Always rejected by this driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    /// Volume to expand.
    pub volume_id: VolumeId,
    /// New desired capacity in bytes.
    pub capacity_bytes: u64,
}

/// Request to stage (mount through the bridge) a volume on a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point, e.g. `/var/lib/kubelet/.../globalmount`.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Backend selection and credentials.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Plugin info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi.rclone.storage"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("bucket/vol-abc".into());
        assert_eq!(id.to_string(), "bucket/vol-abc");
        assert!(!id.is_empty());
        assert!(VolumeId::default().is_empty());
    }

    #[test]
    fn volume_serde_roundtrip() {
        let vol = Volume {
            volume_id: VolumeId("v1".into()),
            capacity_bytes: 1024 * 1024,
            volume_context: HashMap::from([("capacity".into(), "1048576".into())]),
        };
        let json = serde_json::to_string(&vol).expect("serialize");
        let de: Volume = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de.volume_id, vol.volume_id);
        assert_eq!(de.volume_context, vol.volume_context);
    }

    #[test]
    fn create_volume_request_default() {
        let req = CreateVolumeRequest::default();
        assert!(req.name.is_empty());
        assert_eq!(req.capacity_bytes, 0);
        assert!(req.volume_capabilities.is_empty());
    }

    #[test]
    fn volume_capability_default() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::MultiNodeMultiWriter);
    }

    #[test]
    fn validate_response_confirmation() {
        let rejected = ValidateVolumeCapabilitiesResponse {
            confirmed: None,
            message: "nope".into(),
        };
        assert!(!rejected.is_confirmed());
    }
}
