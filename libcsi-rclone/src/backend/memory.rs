//! In-memory [`ObjectStore`], [`RemoteFs`] and [`Mounter`] for tests.
//!
//! Compiled for this crate's unit tests and, through the `testing` feature,
//! for integration tests and downstream test suites.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ObjectStore, RemoteFs};
use crate::error::CsiError;
use crate::mounter::{MountArguments, Mounter};

/// Buckets and their object keys, held in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<BTreeMap<String, BTreeSet<String>>>,
    fail_prefix_writes: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent [`ObjectStore::create_prefix`] calls fail.
    pub fn fail_prefix_writes(&self, fail: bool) {
        self.fail_prefix_writes.store(fail, Ordering::SeqCst);
    }

    /// Store an object directly, creating the bucket if needed.
    pub fn put_object(&self, bucket: &str, key: &str) {
        self.buckets
            .lock()
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned());
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.lock().contains_key(bucket)
    }

    /// Keys in `bucket`, sorted; empty if the bucket is missing.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .get(bucket)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, CsiError> {
        Ok(self.has_bucket(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.buckets.lock().entry(bucket.to_owned()).or_default();
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<(), CsiError> {
        self.buckets
            .lock()
            .remove(bucket)
            .map(drop)
            .ok_or_else(|| CsiError::VolumeNotFound(bucket.to_owned()))
    }

    async fn create_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        if self.fail_prefix_writes.load(Ordering::SeqCst) {
            return Err(CsiError::backend("injected prefix write failure"));
        }
        let mut buckets = self.buckets.lock();
        let keys = buckets
            .get_mut(bucket)
            .ok_or_else(|| CsiError::BackendError(format!("NoSuchBucket: {bucket}")))?;
        keys.insert(format!("{}/", prefix.trim_end_matches('/')));
        Ok(())
    }

    async fn remove_prefix(&self, bucket: &str, prefix: &str) -> Result<(), CsiError> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        if let Some(keys) = self.buckets.lock().get_mut(bucket) {
            keys.retain(|key| !key.starts_with(&dir));
        }
        Ok(())
    }
}

/// A remote file tree held in memory; each path maps to "is a directory".
#[derive(Debug, Default)]
pub struct MemoryRemoteFs {
    entries: Mutex<BTreeMap<String, bool>>,
    fail_writes: AtomicBool,
}

impl MemoryRemoteFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent [`RemoteFs::create_dir_all`] calls fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Place a regular file at `path`.
    pub fn put_file(&self, path: &str) {
        self.entries.lock().insert(normalize(path), false);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.entries.lock().contains_key(&normalize(path))
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[async_trait]
impl RemoteFs for MemoryRemoteFs {
    async fn create_dir_all(&self, path: &str) -> Result<(), CsiError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CsiError::backend("injected write failure"));
        }
        let path = normalize(path);
        let mut entries = self.entries.lock();
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            match entries.get(&current) {
                Some(false) => {
                    return Err(CsiError::BackendError(format!(
                        "mkdir {path}: {current} is not a directory"
                    )));
                }
                Some(true) => {}
                None => {
                    entries.insert(current.clone(), true);
                }
            }
        }
        Ok(())
    }

    async fn is_dir(&self, path: &str) -> Result<Option<bool>, CsiError> {
        Ok(self.entries.lock().get(&normalize(path)).copied())
    }

    async fn remove_all(&self, path: &str) -> Result<(), CsiError> {
        let path = normalize(path);
        let children = format!("{path}/");
        self.entries
            .lock()
            .retain(|entry, _| *entry != path && !entry.starts_with(&children));
        Ok(())
    }
}

/// [`Mounter`] that records every call instead of mounting.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    calls: Mutex<Vec<(String, MountArguments)>>,
    fail: AtomicBool,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent mounts fail with `MountFailed`.
    pub fn fail_mounts(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Every `(target, arguments)` pair seen so far, oldest first.
    pub fn calls(&self) -> Vec<(String, MountArguments)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn mount(&self, target: &str, arguments: &MountArguments) -> Result<(), CsiError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CsiError::MountFailed {
                path: target.to_owned(),
                reason: "injected mount failure".into(),
            });
        }
        self.calls
            .lock()
            .push((target.to_owned(), arguments.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn object_store_prefixes() {
        let store = MemoryObjectStore::new();
        store.create_bucket("b").await.unwrap();
        store.create_prefix("b", "vol").await.unwrap();
        store.put_object("b", "vol/data.bin");
        store.put_object("b", "volume2/");
        store.remove_prefix("b", "vol").await.unwrap();
        assert_eq!(store.keys("b"), vec!["volume2/"]);

        assert!(store.remove_prefix("missing", "vol").await.is_ok());
        assert!(matches!(
            store.remove_bucket("missing").await,
            Err(CsiError::VolumeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn prefix_write_failure_injection() {
        let store = MemoryObjectStore::new();
        store.create_bucket("b").await.unwrap();
        store.fail_prefix_writes(true);
        assert!(store.create_prefix("b", "p").await.is_err());
    }

    #[tokio::test]
    async fn remote_fs_tree() {
        let fs = MemoryRemoteFs::new();
        fs.create_dir_all("/srv/data/vol/").await.unwrap();
        assert_eq!(fs.is_dir("/srv").await.unwrap(), Some(true));
        assert_eq!(fs.is_dir("/srv/data/vol").await.unwrap(), Some(true));
        assert_eq!(fs.is_dir("/nope").await.unwrap(), None);

        fs.put_file("/srv/file");
        assert_eq!(fs.is_dir("/srv/file").await.unwrap(), Some(false));
        assert!(fs.create_dir_all("/srv/file/sub").await.is_err());

        fs.remove_all("/srv/data").await.unwrap();
        assert!(!fs.exists("/srv/data/vol"));
        assert!(fs.exists("/srv"));
        assert!(fs.remove_all("/srv/data").await.is_ok());
    }
}
