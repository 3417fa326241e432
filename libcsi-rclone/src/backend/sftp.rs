//! SFTP backend: every volume is a directory on a remote SSH host.
//!
//! The identifier is `<name>` or `<name>/<path_prefix>`; the directory it
//! names is `/<name>` or `/<path_prefix>/<name>`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::remote_fs::{SshAuth, SshRemoteFs};
use super::{RemoteFs, Storage};
use crate::config::{RCLONE_OPTIONS_KEY, StorageConfig};
use crate::error::CsiError;
use crate::mounter::{MountArguments, Mounter};
use crate::registry::BackendRegistry;
use crate::types::{CreateVolumeRequest, VolumeId};
use crate::{options, volume_id};

/// Name this backend registers under.
pub const STORAGE_TYPE: &str = "sftp";

const HOST_KEY: &str = "host";
const PORT_KEY: &str = "port";
const USER_KEY: &str = "user";
const PASSWORD_KEY: &str = "password";
const PRIVATE_KEY_KEY: &str = "private_key";
const PATH_PREFIX_KEY: &str = "path_prefix";

const DEFAULT_PORT: u16 = 22;

/// Connection settings parsed from a [`StorageConfig`].
#[derive(Clone, PartialEq, Eq)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    /// Remote directory holding volume roots, without surrounding slashes.
    pub path_prefix: String,
}

impl SftpConfig {
    pub fn from_config(config: &StorageConfig) -> Result<Self, CsiError> {
        let port = match config.get(PORT_KEY) {
            None => DEFAULT_PORT,
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(0) => DEFAULT_PORT,
                Ok(port) => port,
                Err(e) => {
                    return Err(CsiError::InvalidArgument(format!("port {raw:?}: {e}")));
                }
            },
        };
        let password = config.get(PASSWORD_KEY).map(str::to_owned);
        let private_key = config.get(PRIVATE_KEY_KEY).map(str::to_owned);
        if password.is_none() && private_key.is_none() {
            return Err(CsiError::InvalidArgument(format!(
                "one of {PASSWORD_KEY:?} or {PRIVATE_KEY_KEY:?} is required"
            )));
        }
        Ok(Self {
            host: config.require(HOST_KEY)?.to_owned(),
            port,
            user: config.require(USER_KEY)?.to_owned(),
            password,
            private_key,
            path_prefix: config
                .get(PATH_PREFIX_KEY)
                .unwrap_or_default()
                .trim_matches('/')
                .to_owned(),
        })
    }

    /// SSH authentication to use; the private key wins when both are set.
    pub fn auth(&self) -> Result<SshAuth, CsiError> {
        match (&self.private_key, &self.password) {
            (Some(key), _) => Ok(SshAuth::PrivateKey(key.clone())),
            (None, Some(password)) => Ok(SshAuth::Password(password.clone())),
            (None, None) => Err(CsiError::InvalidArgument("no SSH credentials".into())),
        }
    }
}

impl std::fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| ".."))
            .field("private_key", &self.private_key.as_ref().map(|_| ".."))
            .field("path_prefix", &self.path_prefix)
            .finish()
    }
}

/// Remote directory backing the volume decoded as `(name, prefix)`.
fn root_path(name: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        format!("/{name}")
    } else {
        format!("/{prefix}/{name}")
    }
}

/// [`Storage`] backed by a [`RemoteFs`].
pub struct SftpStorage {
    config: SftpConfig,
    raw: StorageConfig,
    client: Arc<dyn RemoteFs>,
    mounter: Arc<dyn Mounter>,
}

impl SftpStorage {
    pub fn new(
        raw: StorageConfig,
        client: Arc<dyn RemoteFs>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self, CsiError> {
        Ok(Self {
            config: SftpConfig::from_config(&raw)?,
            raw,
            client,
            mounter,
        })
    }

    fn mount_arguments(&self, root: &str, target: &str, extra_options: Option<&str>) -> MountArguments {
        let base = vec![
            "mount".to_owned(),
            format!(":sftp:{root}"),
            target.to_owned(),
            "--daemon".to_owned(),
            format!("--sftp-host={}", self.config.host),
            format!("--sftp-user={}", self.config.user),
            format!("--sftp-port={}", self.config.port),
            "--allow-other".to_owned(),
            "--vfs-cache-mode=minimal".to_owned(),
        ];
        let extra = extra_options.map(options::parse).unwrap_or_default();

        let mut env = BTreeMap::new();
        if let Some(password) = &self.config.password {
            env.insert("RCLONE_SFTP_PASS".to_owned(), password.clone());
        }
        if let Some(key) = &self.config.private_key {
            // rclone reads the PEM from a single-line variable.
            env.insert("RCLONE_SFTP_KEY_PEM".to_owned(), key.replace('\n', "\\n"));
        }
        MountArguments {
            args: options::merge(&base, &extra),
            env,
        }
    }
}

#[async_trait]
impl Storage for SftpStorage {
    #[instrument(skip(self, req), fields(name = %req.name, host = %self.config.host))]
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<VolumeId, CsiError> {
        let name = volume_id::sanitize(&req.name);
        volume_id::check_container(name.as_str())?;
        let id = volume_id::encode(name.as_str(), &self.config.path_prefix);
        let root = root_path(name.as_str(), &self.config.path_prefix);

        self.client.create_dir_all(&root).await?;
        match self.client.is_dir(&root).await? {
            Some(true) => {
                info!(root, "volume directory ready");
                Ok(id)
            }
            Some(false) => Err(CsiError::Internal(format!("{root} exists but is not a directory"))),
            None => Err(CsiError::Internal(format!("{root} missing after create"))),
        }
    }

    #[instrument(skip(self), fields(volume_id = %volume_id, host = %self.config.host))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let (name, prefix) = volume_id::decode(volume_id);
        let root = root_path(name, prefix);
        self.client.remove_all(&root).await?;
        info!(root, "removed volume directory");
        Ok(())
    }

    #[instrument(skip(self), fields(volume_id = %volume_id, host = %self.config.host))]
    async fn validate_volume_capabilities(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let (name, prefix) = volume_id::decode(volume_id);
        let root = root_path(name, prefix);
        match self.client.is_dir(&root).await? {
            Some(true) => Ok(()),
            Some(false) => Err(CsiError::Internal(format!("{root} is not a directory"))),
            None => Err(CsiError::VolumeNotFound(volume_id.0.clone())),
        }
    }

    #[instrument(skip(self, volume_context), fields(volume_id = %volume_id, host = %self.config.host))]
    async fn mount_stage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), CsiError> {
        let effective = self.raw.overlay(volume_context);
        effective.check_mounter()?;
        let (name, prefix) = volume_id::decode(volume_id);
        let root = root_path(name, prefix);
        let extra = effective
            .mount_options()
            .or_else(|| effective.get(RCLONE_OPTIONS_KEY));
        let arguments = self.mount_arguments(&root, staging_target_path, extra);
        self.mounter.mount(staging_target_path, &arguments).await
    }
}

/// Register the SFTP backend using [`SshRemoteFs`] as the client.
pub fn register(registry: &BackendRegistry, mounter: Arc<dyn Mounter>) {
    register_with(
        registry,
        |config: &SftpConfig| {
            let fs = SshRemoteFs::new(&config.host, config.port, &config.user, config.auth()?);
            Ok(Arc::new(fs) as Arc<dyn RemoteFs>)
        },
        mounter,
    );
}

/// Register the SFTP backend with a custom client factory.
pub fn register_with<F>(registry: &BackendRegistry, client_factory: F, mounter: Arc<dyn Mounter>)
where
    F: Fn(&SftpConfig) -> Result<Arc<dyn RemoteFs>, CsiError> + Send + Sync + 'static,
{
    registry.register(STORAGE_TYPE, move |raw: &StorageConfig| {
        let config = SftpConfig::from_config(raw)?;
        let client = client_factory(&config)?;
        Ok(Arc::new(SftpStorage::new(raw.clone(), client, Arc::clone(&mounter))?) as Arc<dyn Storage>)
    });
}
