//! # libcsi-rclone: pluggable remote storage for a CSI driver
//!
//! `libcsi-rclone` implements the [Container Storage Interface][csi]
//! controller, node and identity services on top of remote storage that is
//! mounted locally through [rclone].  Storage technologies plug in as
//! backends selected per request by the `storage` configuration key; S3 and
//! SFTP ship with the crate.  Like the rest of RK8s it runs on Tokio, logs
//! through `tracing` and reports failures as `thiserror` enums.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and its protocol [`ErrorCode`]. |
//! | [`config`] | [`StorageConfig`] key map and process-level [`DriverConfig`]. |
//! | [`options`] | Shell-like mount option tokenizer and merger. |
//! | [`volume_id`] | Volume name sanitizing and `<container>/<prefix>` codec. |
//! | [`registry`] | [`BackendRegistry`] mapping backend names to constructors. |
//! | [`backend`] | The [`Storage`] contract and the S3 / SFTP backends. |
//! | [`mounter`] | rclone mount bridge and unmount helpers. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: create, delete, validate. |
//! | [`node`] | [`CsiNode`] trait: stage and unstage. |
//! | [`message`] | [`CsiMessage`] request/response envelope. |
//! | [`driver`] | [`StorageDriver`], the lifecycle handler. |
//!
//! ## Composition
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcsi_rclone::{BackendRegistry, DriverConfig, RcloneMounter, StorageDriver};
//! use libcsi_rclone::backend::{s3, sftp};
//!
//! let config = DriverConfig::from_env().expect("valid CSI_* environment");
//! let mounter = Arc::new(RcloneMounter::new(config.rclone_binary.clone(), config.mount_timeout()));
//! let registry = BackendRegistry::new();
//! s3::register(&registry, mounter.clone());
//! sftp::register(&registry, mounter);
//! let driver = StorageDriver::new(config, Arc::new(registry));
//! # let _ = driver;
//! ```
//!
//! [csi]: https://github.com/container-storage-interface/spec
//! [rclone]: https://rclone.org

pub mod backend;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod message;
pub mod mounter;
pub mod node;
pub mod options;
pub mod registry;
pub mod types;
pub mod volume_id;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::Storage;
pub use config::{DriverConfig, StorageConfig};
pub use controller::CsiController;
pub use driver::StorageDriver;
pub use error::{CsiError, ErrorCode};
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use mounter::{MountArguments, Mounter, RcloneMounter};
pub use node::CsiNode;
pub use registry::BackendRegistry;
pub use types::*;
