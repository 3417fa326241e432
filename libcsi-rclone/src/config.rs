//! Driver and storage configuration.
//!
//! [`StorageConfig`] is the string map a backend is built from: the
//! driver's static defaults overlaid by the request's secrets and
//! parameters.  [`DriverConfig`] holds the process-level settings, loaded
//! from YAML or from environment variables:
//!
//! - `CSI_PLUGIN_NAME`: advertised plugin name.
//! - `CSI_NODE_ID`: identifier of the node this process runs on.
//! - `CSI_RCLONE_BINARY`: path to the rclone executable. Defaults to `rclone`.
//! - `CSI_MOUNT_TIMEOUT_SECS`: how long to wait for a mount to appear after
//!   the bridge detaches. Defaults to `10`; `0` disables the wait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CsiError;

/// Backend selector.
pub const STORAGE_KEY: &str = "storage";
/// Shared-container override (S3 bucket).
pub const BUCKET_KEY: &str = "bucket";
/// Free-form, shell-quoted mount option string.
pub const OPTIONS_KEY: &str = "options";
/// Legacy spelling of [`OPTIONS_KEY`] accepted by the SFTP backend.
pub const RCLONE_OPTIONS_KEY: &str = "rclone_options";
/// Mount bridge type.
pub const MOUNTER_KEY: &str = "mounter";
/// Declared capacity, written into the volume context at creation.
pub const CAPACITY_KEY: &str = "capacity";

/// The only supported mount bridge.
pub const RCLONE_MOUNTER: &str = "rclone";

const DEFAULT_PLUGIN_NAME: &str = "csi.rclone.storage";
const DEFAULT_RCLONE_BINARY: &str = "rclone";
const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 10;

/// String-keyed configuration for one storage backend.
///
/// Empty values are treated as absent by every accessor.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct StorageConfig(HashMap<String, String>);

impl StorageConfig {
    /// An empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key`, or `None` when absent or empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Value of `key`, failing with `InvalidArgument` when absent or empty.
    pub fn require(&self, key: &str) -> Result<&str, CsiError> {
        self.get(key)
            .ok_or_else(|| CsiError::InvalidArgument(format!("missing required config key {key:?}")))
    }

    /// Insert or replace a single entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// A copy of this configuration with every entry of `overrides` applied
    /// on top; on key collision the override wins.
    pub fn overlay(&self, overrides: &HashMap<String, String>) -> Self {
        let mut merged = self.0.clone();
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(merged)
    }

    /// The backend selector, lowercased.
    pub fn storage_type(&self) -> Option<String> {
        self.get(STORAGE_KEY).map(str::to_lowercase)
    }

    /// The user-supplied mount option string, if any.
    pub fn mount_options(&self) -> Option<&str> {
        self.get(OPTIONS_KEY)
    }

    /// Check that the requested mount bridge is one this crate can drive.
    pub fn check_mounter(&self) -> Result<(), CsiError> {
        match self.get(MOUNTER_KEY) {
            None => Ok(()),
            Some(m) if m.eq_ignore_ascii_case(RCLONE_MOUNTER) => Ok(()),
            Some(other) => Err(CsiError::InvalidArgument(format!(
                "unsupported mounter {other:?}, only {RCLONE_MOUNTER:?} is available"
            ))),
        }
    }
}

impl From<HashMap<String, String>> for StorageConfig {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for StorageConfig {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        )
    }
}

// Values may hold credentials, so only the keys are printed.
impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("StorageConfig").field("keys", &keys).finish()
    }
}

/// Process-level driver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name reported by `GetPluginInfo`.
    pub plugin_name: String,
    /// Identifier of the node this process runs on.
    pub node_id: String,
    /// rclone executable used as the mount bridge.
    pub rclone_binary: PathBuf,
    /// Seconds to wait for the mount point to appear after rclone detaches.
    pub mount_timeout_secs: u64,
    /// Static backend configuration overlaid by every request.
    pub defaults: StorageConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            node_id: String::new(),
            rclone_binary: PathBuf::from(DEFAULT_RCLONE_BINARY),
            mount_timeout_secs: DEFAULT_MOUNT_TIMEOUT_SECS,
            defaults: StorageConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CsiError> {
        serde_yaml::from_str(yaml).map_err(|e| CsiError::InvalidArgument(format!("driver config: {e}")))
    }

    /// Build the configuration from `CSI_*` environment variables.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CsiError> {
        let mut config = Self::default();
        if let Some(name) = lookup("CSI_PLUGIN_NAME") {
            config.plugin_name = name;
        }
        if let Some(node_id) = lookup("CSI_NODE_ID") {
            config.node_id = node_id;
        }
        if let Some(binary) = lookup("CSI_RCLONE_BINARY") {
            config.rclone_binary = PathBuf::from(binary);
        }
        if let Some(secs) = lookup("CSI_MOUNT_TIMEOUT_SECS") {
            config.mount_timeout_secs = secs.trim().parse().map_err(|e| {
                CsiError::InvalidArgument(format!("CSI_MOUNT_TIMEOUT_SECS={secs:?}: {e}"))
            })?;
        }
        Ok(config)
    }

    /// Mount wait as a [`Duration`].
    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }
}
