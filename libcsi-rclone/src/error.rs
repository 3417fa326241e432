//! CSI error types.
//!
//! All errors in the crate are represented by the [`CsiError`] enum, which
//! derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel inside a
//! [`CsiMessage`](crate::message::CsiMessage) envelope.
//!
//! Callers that need the protocol-level status class use [`CsiError::code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level error class reported to the caller of a lifecycle
/// operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or missing request fields; never worth retrying unchanged.
    InvalidArgument,
    /// The referenced container or prefix does not exist.
    NotFound,
    /// The operation is not supported by this driver.
    Unimplemented,
    /// Any unexpected backend or transport failure.
    Internal,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume (or its backing container) was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// No storage backend is registered under the requested name.
    #[error("no storage backend registered as {0:?}")]
    UnknownStorage(String),

    /// The operation is not implemented by this driver.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// Volume creation failed after part of the volume was provisioned.
    ///
    /// `volume_id` is the best-known identifier so the caller can issue a
    /// matching delete to clean up.
    #[error("volume {volume_id} partially created: {reason}")]
    CreateIncomplete {
        /// Identifier of the partially created volume.
        volume_id: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The storage service (object store, SSH server) returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Classify this error into its protocol-level [`ErrorCode`].
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::VolumeNotFound(_) | Self::UnknownStorage(_) => ErrorCode::NotFound,
            Self::Unimplemented(_) => ErrorCode::Unimplemented,
            Self::CreateIncomplete { .. }
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Wrap this error for the caller of `operation`.
    ///
    /// Errors that already carry a specific class (`InvalidArgument`,
    /// `NotFound`, `Unimplemented`) and partial-create errors (which carry a
    /// volume identifier) pass through unchanged; everything else becomes
    /// [`CsiError::Internal`] with the cause text appended.
    pub fn context(self, operation: &str) -> Self {
        match self {
            Self::CreateIncomplete { .. } => self,
            e if e.code() != ErrorCode::Internal => e,
            e => Self::Internal(format!("{operation}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
    }

    #[test]
    fn codes() {
        assert_eq!(CsiError::invalid("x").code(), ErrorCode::InvalidArgument);
        assert_eq!(CsiError::VolumeNotFound("v".into()).code(), ErrorCode::NotFound);
        assert_eq!(CsiError::backend("boom").code(), ErrorCode::Internal);
        assert_eq!(
            CsiError::Unimplemented("expand".into()).code(),
            ErrorCode::Unimplemented
        );
    }

    #[test]
    fn context_wraps_only_internal_errors() {
        let wrapped = CsiError::backend("connection reset").context("failed to delete volume");
        assert_eq!(
            wrapped.to_string(),
            "internal error: failed to delete volume: backend error: connection reset"
        );

        let kept = CsiError::VolumeNotFound("b".into()).context("failed to validate");
        assert!(matches!(kept, CsiError::VolumeNotFound(_)));

        let partial = CsiError::CreateIncomplete {
            volume_id: "b/p".into(),
            reason: "marker".into(),
        }
        .context("failed to create volume");
        assert!(matches!(partial, CsiError::CreateIncomplete { .. }));
    }
}
