//! S3-compatible object storage backend.
//!
//! A volume is either a whole bucket (`<name>`) or, when the `bucket` key
//! names a shared bucket, a prefix inside it (`<bucket>/<name>`).  Mounting
//! goes through rclone's `:s3:` remote with credentials passed via the
//! environment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::object_store::HttpObjectStore;
use super::{ObjectStore, Storage};
use crate::config::{BUCKET_KEY, StorageConfig};
use crate::error::CsiError;
use crate::mounter::{MountArguments, Mounter};
use crate::registry::BackendRegistry;
use crate::types::{CreateVolumeRequest, VolumeId};
use crate::{options, volume_id};

/// Name this backend registers under.
pub const STORAGE_TYPE: &str = "s3";

const ACCESS_KEY_ID_KEY: &str = "accessKeyID";
const SECRET_ACCESS_KEY_KEY: &str = "secretAccessKey";
const ENDPOINT_KEY: &str = "endpoint";
const REGION_KEY: &str = "region";

/// Connection settings parsed from a [`StorageConfig`].
#[derive(Clone, PartialEq, Eq)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
    pub region: Option<String>,
    /// Shared bucket; volumes become prefixes inside it.
    pub bucket: Option<String>,
}

impl S3Config {
    pub fn from_config(config: &StorageConfig) -> Result<Self, CsiError> {
        let bucket = config.get(BUCKET_KEY).map(str::to_owned);
        if let Some(shared) = &bucket {
            volume_id::check_container(shared)?;
        }
        Ok(Self {
            access_key_id: config.require(ACCESS_KEY_ID_KEY)?.to_owned(),
            secret_access_key: config.require(SECRET_ACCESS_KEY_KEY)?.to_owned(),
            endpoint: config.require(ENDPOINT_KEY)?.to_owned(),
            region: config.get(REGION_KEY).map(str::to_owned),
            bucket,
        })
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("access_key_id", &self.access_key_id)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// [`Storage`] backed by an [`ObjectStore`].
pub struct S3Storage {
    config: S3Config,
    raw: StorageConfig,
    client: Arc<dyn ObjectStore>,
    mounter: Arc<dyn Mounter>,
}

impl S3Storage {
    pub fn new(
        raw: StorageConfig,
        client: Arc<dyn ObjectStore>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self, CsiError> {
        Ok(Self {
            config: S3Config::from_config(&raw)?,
            raw,
            client,
            mounter,
        })
    }

    /// rclone arguments and environment for mounting `bucket[/prefix]` at
    /// `target`.
    fn mount_arguments(
        &self,
        bucket: &str,
        prefix: &str,
        target: &str,
        extra_options: Option<&str>,
    ) -> MountArguments {
        let remote = if prefix.is_empty() {
            format!(":s3:{bucket}")
        } else {
            format!(":s3:{bucket}/{prefix}")
        };
        let mut base = vec![
            "mount".to_owned(),
            remote,
            target.to_owned(),
            "--daemon".to_owned(),
            "--s3-provider=AWS".to_owned(),
            "--s3-env-auth=true".to_owned(),
            format!("--s3-endpoint={}", self.config.endpoint),
            "--allow-other".to_owned(),
            "--vfs-cache-mode=writes".to_owned(),
        ];
        if let Some(region) = &self.config.region {
            base.push(format!("--s3-region={region}"));
        }
        let extra = extra_options.map(options::parse).unwrap_or_default();

        MountArguments {
            args: options::merge(&base, &extra),
            env: BTreeMap::from([
                (
                    "AWS_ACCESS_KEY_ID".to_owned(),
                    self.config.access_key_id.clone(),
                ),
                (
                    "AWS_SECRET_ACCESS_KEY".to_owned(),
                    self.config.secret_access_key.clone(),
                ),
            ]),
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<VolumeId, CsiError> {
        let name = volume_id::sanitize(&req.name);
        let (bucket, prefix) = match &self.config.bucket {
            Some(shared) => (shared.as_str(), name.as_str()),
            None => (name.as_str(), ""),
        };
        volume_id::check_container(bucket)?;
        let id = volume_id::encode(bucket, prefix);

        if self.client.bucket_exists(bucket).await? {
            debug!(bucket, "bucket already exists");
        } else {
            self.client.create_bucket(bucket).await?;
            info!(bucket, "created bucket");
        }

        if !prefix.is_empty() {
            self.client
                .create_prefix(bucket, prefix)
                .await
                .map_err(|e| CsiError::CreateIncomplete {
                    volume_id: id.0.clone(),
                    reason: e.to_string(),
                })?;
            info!(bucket, prefix, "created prefix");
        }
        Ok(id)
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let (bucket, prefix) = volume_id::decode(volume_id);
        if !prefix.is_empty() {
            self.client.remove_prefix(bucket, prefix).await?;
            info!(bucket, prefix, "removed prefix");
            return Ok(());
        }
        match self.client.remove_bucket(bucket).await {
            Ok(()) => {
                info!(bucket, "removed bucket");
                Ok(())
            }
            Err(CsiError::VolumeNotFound(_)) => {
                warn!(bucket, "bucket already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(volume_id = %volume_id))]
    async fn validate_volume_capabilities(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let (bucket, _) = volume_id::decode(volume_id);
        if self.client.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(CsiError::VolumeNotFound(volume_id.0.clone()))
        }
    }

    #[instrument(skip(self, volume_context), fields(volume_id = %volume_id))]
    async fn mount_stage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), CsiError> {
        let effective = self.raw.overlay(volume_context);
        effective.check_mounter()?;
        let (bucket, prefix) = volume_id::decode(volume_id);
        let arguments = self.mount_arguments(
            bucket,
            prefix,
            staging_target_path,
            effective.mount_options(),
        );
        self.mounter.mount(staging_target_path, &arguments).await
    }
}

/// Register the S3 backend using [`HttpObjectStore`] as the client.
pub fn register(registry: &BackendRegistry, mounter: Arc<dyn Mounter>) {
    register_with(
        registry,
        |config: &S3Config| {
            let client = HttpObjectStore::new(
                &config.endpoint,
                config.region.as_deref().unwrap_or_default(),
                &config.access_key_id,
                &config.secret_access_key,
            )?;
            Ok(Arc::new(client) as Arc<dyn ObjectStore>)
        },
        mounter,
    );
}

/// Register the S3 backend with a custom client factory.
pub fn register_with<F>(registry: &BackendRegistry, client_factory: F, mounter: Arc<dyn Mounter>)
where
    F: Fn(&S3Config) -> Result<Arc<dyn ObjectStore>, CsiError> + Send + Sync + 'static,
{
    registry.register(STORAGE_TYPE, move |raw: &StorageConfig| {
        let config = S3Config::from_config(raw)?;
        let client = client_factory(&config)?;
        Ok(Arc::new(S3Storage::new(raw.clone(), client, Arc::clone(&mounter))?) as Arc<dyn Storage>)
    });
}
