//! The lifecycle handler: validates requests, picks a backend, forwards.
//!
//! [`StorageDriver`] implements [`CsiIdentity`], [`CsiController`] and
//! [`CsiNode`].  It holds no per-volume state; each call resolves its backend
//! from the [`BackendRegistry`] using the driver's static defaults overlaid
//! by whatever configuration the request carries:
//!
//! | Operation | Configuration source (later wins) |
//! |---|---|
//! | create | defaults, secrets, parameters |
//! | delete, validate | defaults, secrets |
//! | stage | defaults, secrets, volume context |

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Storage, s3, sftp};
use crate::config::{CAPACITY_KEY, DriverConfig, STORAGE_KEY, StorageConfig};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::mounter::{self, Mounter, RcloneMounter};
use crate::node::CsiNode;
use crate::registry::BackendRegistry;
use crate::types::*;

/// The only access mode volumes are confirmed for.
pub const SUPPORTED_ACCESS_MODE: AccessMode = AccessMode::MultiNodeMultiWriter;

/// CSI driver routing every operation to a registered storage backend.
#[derive(Debug)]
pub struct StorageDriver {
    config: DriverConfig,
    registry: Arc<BackendRegistry>,
}

impl StorageDriver {
    pub fn new(config: DriverConfig, registry: Arc<BackendRegistry>) -> Self {
        Self { config, registry }
    }

    /// Driver with the S3 and SFTP backends registered, mounting through
    /// the rclone binary named in `config`.
    pub fn with_default_backends(config: DriverConfig) -> Self {
        let mounter: Arc<dyn Mounter> = Arc::new(RcloneMounter::new(
            config.rclone_binary.clone(),
            config.mount_timeout(),
        ));
        let registry = BackendRegistry::new();
        s3::register(&registry, Arc::clone(&mounter));
        sftp::register(&registry, mounter);
        Self::new(config, Arc::new(registry))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Run the operation named by a request message and wrap its result in
    /// the matching response message.
    pub async fn dispatch(&self, request: CsiMessage) -> CsiMessage {
        debug!(%request, "dispatching");
        let result = match request {
            CsiMessage::CreateVolume(req) => {
                self.create_volume(req).await.map(CsiMessage::VolumeCreated)
            }
            CsiMessage::DeleteVolume(req) => self.delete_volume(req).await.map(|()| CsiMessage::Ok),
            CsiMessage::ValidateVolumeCapabilities(req) => self
                .validate_volume_capabilities(req)
                .await
                .map(CsiMessage::CapabilitiesValidated),
            CsiMessage::ControllerExpandVolume(req) => self
                .controller_expand_volume(req)
                .await
                .map(CsiMessage::VolumeExpanded),
            CsiMessage::StageVolume(req) => self.stage_volume(req).await.map(|()| CsiMessage::Ok),
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => self
                .unstage_volume(&volume_id, &staging_target_path)
                .await
                .map(|()| CsiMessage::Ok),
            CsiMessage::Probe => self.probe().await.map(CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => self
                .get_plugin_info()
                .await
                .map(CsiMessage::PluginInfoResponse),
            CsiMessage::GetPluginCapabilities => self
                .get_plugin_capabilities()
                .await
                .map(CsiMessage::PluginCapabilitiesResponse),
            other => Err(CsiError::InvalidArgument(format!(
                "{other} is not a request"
            ))),
        };
        result.unwrap_or_else(CsiMessage::Error)
    }

    fn resolve(
        &self,
        layers: &[&HashMap<String, String>],
    ) -> Result<(StorageConfig, Arc<dyn Storage>), CsiError> {
        let config = layers
            .iter()
            .fold(self.config.defaults.clone(), |acc, layer| acc.overlay(layer));
        let backend = self
            .registry
            .resolve(&config)
            .map_err(|e| e.context("failed to resolve storage backend"))?;
        Ok((config, backend))
    }
}

fn require_volume_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    if volume_id.is_empty() {
        return Err(CsiError::InvalidArgument("volume ID missing in request".into()));
    }
    Ok(())
}

fn require_capabilities(capabilities: &[VolumeCapability]) -> Result<(), CsiError> {
    if capabilities.is_empty() {
        return Err(CsiError::InvalidArgument(
            "volume capabilities missing in request".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for StorageDriver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.plugin_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for StorageDriver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name missing in request".into()));
        }
        require_capabilities(&req.volume_capabilities)?;

        let (config, backend) = self.resolve(&[&req.secrets, &req.parameters])?;
        let volume_id = backend
            .create_volume(&req)
            .await
            .map_err(|e| e.context("failed to create volume"))?;

        let mut volume_context = req.parameters;
        volume_context.insert(CAPACITY_KEY.to_owned(), req.capacity_bytes.to_string());
        if let Some(storage) = config.storage_type() {
            volume_context
                .entry(STORAGE_KEY.to_owned())
                .or_insert(storage);
        }

        info!(%volume_id, "volume created");
        Ok(Volume {
            volume_id,
            capacity_bytes: req.capacity_bytes,
            volume_context,
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        let (_, backend) = self.resolve(&[&req.secrets])?;
        backend
            .delete_volume(&req.volume_id)
            .await
            .map_err(|e| e.context("failed to delete volume"))?;
        info!(volume_id = %req.volume_id, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        require_volume_id(&req.volume_id)?;
        require_capabilities(&req.volume_capabilities)?;

        let (_, backend) = self.resolve(&[&req.secrets])?;
        backend
            .validate_volume_capabilities(&req.volume_id)
            .await
            .map_err(|e| e.context("failed to validate volume capabilities"))?;

        if let Some(unsupported) = req
            .volume_capabilities
            .iter()
            .find(|cap| cap.access_mode != SUPPORTED_ACCESS_MODE)
        {
            debug!(mode = ?unsupported.access_mode, "rejecting access mode");
            return Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: format!(
                    "access mode {:?} is not supported, only {SUPPORTED_ACCESS_MODE:?}",
                    unsupported.access_mode
                ),
            });
        }
        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(req.volume_capabilities),
            message: String::new(),
        })
    }

    async fn controller_expand_volume(
        &self,
        _req: ControllerExpandVolumeRequest,
    ) -> Result<u64, CsiError> {
        Err(CsiError::Unimplemented("ControllerExpandVolume".into()))
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for StorageDriver {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        if req.staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path missing in request".into()));
        }
        if req.volume_capability.is_none() {
            return Err(CsiError::InvalidArgument("volume capability missing in request".into()));
        }

        let staging = req.staging_target_path.as_str();
        if mounter::is_mountpoint(staging).await {
            debug!(path = staging, "staging path already mounted, assuming idempotent retry");
            return Ok(());
        }

        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| CsiError::MountFailed {
                path: staging.to_owned(),
                reason: e.to_string(),
            })?;

        let (_, backend) = self.resolve(&[&req.secrets, &req.volume_context])?;
        backend
            .mount_stage_volume(&req.volume_id, staging, &req.volume_context)
            .await
            .map_err(|e| e.context("failed to stage volume"))?;

        info!(path = staging, "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require_volume_id(volume_id)?;
        if staging_target_path.is_empty() {
            return Err(CsiError::InvalidArgument("staging target path missing in request".into()));
        }

        let staging = Path::new(staging_target_path);
        if !staging.exists() {
            debug!(%volume_id, "staging path gone, nothing to unstage");
            return Ok(());
        }

        if mounter::is_mountpoint(staging_target_path).await {
            mounter::unmount(staging_target_path).await?;
        } else {
            debug!(%volume_id, "staging path not mounted");
        }

        match tokio::fs::remove_dir(staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = staging_target_path, error = %e, "failed to remove staging directory");
                return Err(CsiError::UnmountFailed {
                    path: staging_target_path.to_owned(),
                    reason: e.to_string(),
                });
            }
        }

        info!(%volume_id, path = staging_target_path, "volume unstaged");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::backend::memory::{MemoryObjectStore, MemoryRemoteFs, RecordingMounter};
    use crate::backend::{ObjectStore, RemoteFs};
    use crate::error::ErrorCode;

    struct Fixture {
        driver: StorageDriver,
        store: Arc<MemoryObjectStore>,
        mounter: Arc<RecordingMounter>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new());
        let mounter = Arc::new(RecordingMounter::new());
        let registry = BackendRegistry::new();
        let factory_store = Arc::clone(&store);
        s3::register_with(
            &registry,
            move |_| Ok(Arc::clone(&factory_store) as Arc<dyn ObjectStore>),
            mounter.clone(),
        );

        let config = DriverConfig {
            defaults: StorageConfig::from([
                ("accessKeyID", "AKIA"),
                ("secretAccessKey", "s3cr3t"),
                ("endpoint", "http://minio.local:9000"),
            ]),
            ..Default::default()
        };
        Fixture {
            driver: StorageDriver::new(config, Arc::new(registry)),
            store,
            mounter,
        }
    }

    fn s3_params() -> HashMap<String, String> {
        HashMap::from([("storage".to_owned(), "S3".to_owned())])
    }

    fn create_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes: 1 << 30,
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: s3_params(),
            secrets: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_echoes_parameters_into_context() {
        let f = fixture();
        let mut req = create_request("Vol-A");
        req.parameters.insert("options".into(), "--read-only".into());
        let vol = f.driver.create_volume(req).await.unwrap();

        assert_eq!(vol.volume_id.as_str(), "vol-a");
        assert_eq!(vol.capacity_bytes, 1 << 30);
        assert_eq!(vol.volume_context["capacity"], "1073741824");
        assert_eq!(vol.volume_context["options"], "--read-only");
        assert_eq!(vol.volume_context["storage"], "S3");
        assert!(f.store.has_bucket("vol-a"));
    }

    #[tokio::test]
    async fn storage_from_secrets_is_added_to_context() {
        let f = fixture();
        let mut req = create_request("vol-b");
        req.parameters.clear();
        req.secrets = s3_params();
        let vol = f.driver.create_volume(req).await.unwrap();
        assert_eq!(vol.volume_context["storage"], "s3");
    }

    #[tokio::test]
    async fn create_validates_request() {
        let f = fixture();
        let err = f.driver.create_volume(create_request("")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let mut req = create_request("x");
        req.volume_capabilities.clear();
        let err = f.driver.create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn unknown_storage_is_not_found() {
        let f = fixture();
        let mut req = create_request("x");
        req.parameters.insert("storage".into(), "nfs".into());
        let err = f.driver.create_volume(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn partial_create_keeps_identifier() {
        let f = fixture();
        f.store.fail_prefix_writes(true);
        let mut req = create_request("data");
        req.parameters.insert("bucket".into(), "shared".into());
        let err = f.driver.create_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::CreateIncomplete { ref volume_id, .. } if volume_id == "shared/data"));
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn validate_rejects_other_access_modes() {
        let f = fixture();
        f.driver.create_volume(create_request("v")).await.unwrap();

        let req = ValidateVolumeCapabilitiesRequest {
            volume_id: VolumeId::from("v"),
            volume_capabilities: vec![
                VolumeCapability::default(),
                VolumeCapability::new(AccessMode::SingleNodeWriter),
            ],
            secrets: s3_params(),
        };
        let resp = f.driver.validate_volume_capabilities(req).await.unwrap();
        assert!(!resp.is_confirmed());
        assert!(resp.message.contains("SingleNodeWriter"));

        let req = ValidateVolumeCapabilitiesRequest {
            volume_id: VolumeId::from("v"),
            volume_capabilities: vec![VolumeCapability::default()],
            secrets: s3_params(),
        };
        let resp = f.driver.validate_volume_capabilities(req).await.unwrap();
        assert_eq!(resp.confirmed, Some(vec![VolumeCapability::default()]));
    }

    #[tokio::test]
    async fn empty_secret_overrides_default() {
        let f = fixture();
        let req = ValidateVolumeCapabilitiesRequest {
            volume_id: VolumeId::from("v"),
            volume_capabilities: vec![VolumeCapability::default()],
            secrets: HashMap::from([
                ("storage".to_owned(), "s3".to_owned()),
                ("endpoint".to_owned(), String::new()),
            ]),
        };
        let err = f.driver.validate_volume_capabilities(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn expand_is_unimplemented() {
        let f = fixture();
        let err = f
            .driver
            .controller_expand_volume(ControllerExpandVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);
    }

    #[tokio::test]
    async fn stage_creates_directory_and_mounts() {
        let f = fixture();
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("globalmount");
        let vol = f.driver.create_volume(create_request("v")).await.unwrap();

        f.driver
            .stage_volume(NodeStageVolumeRequest {
                volume_id: vol.volume_id.clone(),
                staging_target_path: staging.to_str().unwrap().to_owned(),
                volume_capability: Some(VolumeCapability::default()),
                volume_context: vol.volume_context,
                secrets: HashMap::new(),
            })
            .await
            .unwrap();

        assert!(staging.is_dir());
        let calls = f.mounter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.args[1], ":s3:v");
    }

    #[tokio::test]
    async fn failed_bridge_fails_stage() {
        let f = fixture();
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("globalmount");
        let vol = f.driver.create_volume(create_request("v")).await.unwrap();
        f.mounter.fail_mounts(true);

        let reply = f
            .driver
            .dispatch(CsiMessage::StageVolume(NodeStageVolumeRequest {
                volume_id: vol.volume_id,
                staging_target_path: staging.to_str().unwrap().to_owned(),
                volume_capability: Some(VolumeCapability::default()),
                volume_context: vol.volume_context,
                secrets: HashMap::new(),
            }))
            .await;
        match reply {
            CsiMessage::Error(e) => {
                assert_eq!(e.code(), ErrorCode::Internal);
                assert!(e.to_string().contains("failed to stage volume"));
            }
            other => panic!("expected an error, got {other}"),
        }
        assert!(f.mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_directory_write_fails_sftp_create() {
        let fs = Arc::new(MemoryRemoteFs::new());
        let registry = BackendRegistry::new();
        let factory_fs = Arc::clone(&fs);
        sftp::register_with(
            &registry,
            move |_| Ok(Arc::clone(&factory_fs) as Arc<dyn RemoteFs>),
            Arc::new(RecordingMounter::new()),
        );
        let driver = StorageDriver::new(DriverConfig::default(), Arc::new(registry));
        fs.fail_writes(true);

        let err = driver
            .create_volume(CreateVolumeRequest {
                name: "data".into(),
                volume_capabilities: vec![VolumeCapability::default()],
                secrets: HashMap::from([
                    ("storage".to_owned(), "sftp".to_owned()),
                    ("host".to_owned(), "files.example.com".to_owned()),
                    ("user".to_owned(), "csi".to_owned()),
                    ("password".to_owned(), "pw".to_owned()),
                ]),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Internal(ref m) if m.starts_with("failed to create volume")));
        assert!(!fs.exists("/data"));
    }

    #[tokio::test]
    async fn stage_requires_capability_and_path() {
        let f = fixture();
        let req = NodeStageVolumeRequest {
            volume_id: VolumeId::from("v"),
            staging_target_path: "/tmp/x".into(),
            ..Default::default()
        };
        let err = f.driver.stage_volume(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let req = NodeStageVolumeRequest {
            volume_id: VolumeId::from("v"),
            volume_capability: Some(VolumeCapability::default()),
            ..Default::default()
        };
        let err = f.driver.stage_volume(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn unstage_removes_unmounted_staging_dir() {
        let f = fixture();
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("globalmount");
        std::fs::create_dir(&staging).unwrap();
        let path = staging.to_str().unwrap();

        let id = VolumeId::from("v");
        f.driver.unstage_volume(&id, path).await.unwrap();
        assert!(!staging.exists());
        f.driver.unstage_volume(&id, path).await.unwrap();
    }

    #[tokio::test]
    async fn identity() {
        let f = fixture();
        let info = f.driver.get_plugin_info().await.unwrap();
        assert_eq!(info.name, "csi.rclone.storage");
        assert!(!info.vendor_version.is_empty());
        assert!(f.driver.probe().await.unwrap());
        assert_eq!(
            f.driver.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );
    }

    #[tokio::test]
    async fn dispatch_maps_requests_to_responses() {
        let f = fixture();
        assert!(matches!(
            f.driver.dispatch(CsiMessage::Probe).await,
            CsiMessage::ProbeResult(true)
        ));
        assert!(matches!(
            f.driver.dispatch(CsiMessage::CreateVolume(create_request("d"))).await,
            CsiMessage::VolumeCreated(ref v) if v.volume_id.as_str() == "d"
        ));
        assert!(matches!(
            f.driver
                .dispatch(CsiMessage::ControllerExpandVolume(Default::default()))
                .await,
            CsiMessage::Error(CsiError::Unimplemented(_))
        ));
        assert!(matches!(
            f.driver.dispatch(CsiMessage::Ok).await,
            CsiMessage::Error(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn default_backends_are_registered() {
        let driver = StorageDriver::with_default_backends(DriverConfig::default());
        assert_eq!(driver.registry().names(), vec!["s3", "sftp"]);
    }
}
