//! Name-keyed table of storage backend constructors.
//!
//! A [`BackendRegistry`] is built once during composition (each backend
//! module contributes a `register` function) and then shared by reference
//! with the [`StorageDriver`](crate::driver::StorageDriver), which resolves
//! a backend per request from the request's configuration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::Storage;
use crate::config::{STORAGE_KEY, StorageConfig};
use crate::error::CsiError;

/// Builds a backend instance from its configuration.
pub type StorageConstructor =
    Arc<dyn Fn(&StorageConfig) -> Result<Arc<dyn Storage>, CsiError> + Send + Sync>;

/// Concurrency-safe map from lowercase backend name to constructor.
#[derive(Default)]
pub struct BackendRegistry {
    constructors: Mutex<HashMap<String, StorageConstructor>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` under `name` (case-insensitive).
    ///
    /// Registering the same name again replaces the previous constructor.
    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn(&StorageConfig) -> Result<Arc<dyn Storage>, CsiError> + Send + Sync + 'static,
    {
        let name = name.to_lowercase();
        debug!(backend = %name, "registering storage backend");
        self.constructors.lock().insert(name, Arc::new(constructor));
    }

    /// Build the backend selected by the `storage` key of `config`.
    ///
    /// Fails with `InvalidArgument` when the key is missing and with
    /// [`CsiError::UnknownStorage`] when no constructor is registered under
    /// that name.  Construction errors are returned as-is.
    pub fn resolve(&self, config: &StorageConfig) -> Result<Arc<dyn Storage>, CsiError> {
        let name = config.storage_type().ok_or_else(|| {
            CsiError::InvalidArgument(format!("missing {STORAGE_KEY:?} key in storage config"))
        })?;
        // Clone the constructor out so the lock is not held while it runs.
        let constructor = self.constructors.lock().get(&name).cloned();
        match constructor {
            Some(constructor) => constructor(config),
            None => Err(CsiError::UnknownStorage(name)),
        }
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::types::{CreateVolumeRequest, VolumeId};

    /// Backend that remembers which constructor produced it.
    struct Tagged(&'static str);

    #[async_trait]
    impl Storage for Tagged {
        async fn create_volume(&self, _req: &CreateVolumeRequest) -> Result<VolumeId, CsiError> {
            Ok(VolumeId::from(self.0))
        }

        async fn delete_volume(&self, _volume_id: &VolumeId) -> Result<(), CsiError> {
            Ok(())
        }

        async fn validate_volume_capabilities(&self, _volume_id: &VolumeId) -> Result<(), CsiError> {
            Ok(())
        }

        async fn mount_stage_volume(
            &self,
            _volume_id: &VolumeId,
            _staging_target_path: &str,
            _volume_context: &HashMap<String, String>,
        ) -> Result<(), CsiError> {
            Ok(())
        }
    }

    async fn tag_of(registry: &BackendRegistry, storage: &str) -> Result<String, CsiError> {
        let backend = registry.resolve(&StorageConfig::from([("storage", storage)]))?;
        let id = backend
            .create_volume(&CreateVolumeRequest::default())
            .await?;
        Ok(id.0)
    }

    #[tokio::test]
    async fn resolves_case_insensitively() {
        let registry = BackendRegistry::new();
        registry.register("S3", |_| Ok(Arc::new(Tagged("s3")) as Arc<dyn Storage>));
        assert_eq!(tag_of(&registry, "s3").await.unwrap(), "s3");
        assert_eq!(tag_of(&registry, "S3").await.unwrap(), "s3");
        assert_eq!(registry.names(), vec!["s3"]);
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = BackendRegistry::new();
        registry.register("sftp", |_| Ok(Arc::new(Tagged("first")) as Arc<dyn Storage>));
        registry.register("SFTP", |_| Ok(Arc::new(Tagged("second")) as Arc<dyn Storage>));
        assert_eq!(tag_of(&registry, "sftp").await.unwrap(), "second");
    }

    #[test]
    fn unknown_backend_is_not_found() {
        let registry = BackendRegistry::new();
        let err = registry
            .resolve(&StorageConfig::from([("storage", "nfs")]))
            .err()
            .unwrap();
        assert!(matches!(err, CsiError::UnknownStorage(ref name) if name == "nfs"));
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
    }

    #[test]
    fn missing_storage_key_is_invalid() {
        let registry = BackendRegistry::new();
        let err = registry.resolve(&StorageConfig::new()).err().unwrap();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn constructor_errors_propagate() {
        let registry = BackendRegistry::new();
        registry.register("s3", |cfg| {
            cfg.require("endpoint")?;
            Ok(Arc::new(Tagged("s3")) as Arc<dyn Storage>)
        });
        let err = registry
            .resolve(&StorageConfig::from([("storage", "s3")]))
            .err()
            .unwrap();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn concurrent_register_and_resolve() {
        let registry = Arc::new(BackendRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let name = format!("backend-{}", i % 2);
                    registry.register(&name, |_| Ok(Arc::new(Tagged("x")) as Arc<dyn Storage>));
                    registry
                        .resolve(&StorageConfig::from([("storage", name.as_str())]))
                        .is_ok()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(registry.names(), vec!["backend-0", "backend-1"]);
    }
}
