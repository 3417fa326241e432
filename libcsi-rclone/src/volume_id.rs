//! Volume identity codec.
//!
//! A [`VolumeId`] is the only durable handle a volume has: every later
//! lifecycle call must be able to locate the volume's storage from the
//! identifier string alone.  The compound form `<container>/<prefix>` places
//! a volume under a prefix inside a shared container; only the first `/`
//! separates the two, so prefixes may themselves contain `/`.

use sha1::{Digest, Sha1};

use crate::error::CsiError;
use crate::types::VolumeId;

/// Longest identifier kept verbatim; longer names are replaced by a digest.
///
/// This is also the longest legal S3 bucket name.
pub const MAX_VOLUME_ID_LEN: usize = 63;

/// Turn an arbitrary proposed volume name into a bounded identifier.
///
/// The name is lowercased.  If the result is longer than
/// [`MAX_VOLUME_ID_LEN`] bytes it is replaced by the 40-character lowercase
/// hex SHA-1 digest of the lowercased name, which is stable across calls.
pub fn sanitize(name: &str) -> VolumeId {
    let lowered = name.to_lowercase();
    if lowered.len() > MAX_VOLUME_ID_LEN {
        return VolumeId(hex::encode(Sha1::digest(lowered.as_bytes())));
    }
    VolumeId(lowered)
}

/// Build the identifier for `prefix` inside `container`.
///
/// An empty prefix yields the container alone.
pub fn encode(container: &str, prefix: &str) -> VolumeId {
    if prefix.is_empty() {
        VolumeId(container.to_owned())
    } else {
        VolumeId(format!("{container}/{prefix}"))
    }
}

/// Reject a container that [`decode`] would not give back unchanged.
///
/// The first `/` of an identifier ends the container, so the container
/// itself must not hold one.
pub fn check_container(container: &str) -> Result<(), CsiError> {
    if container.contains('/') {
        return Err(CsiError::InvalidArgument(format!(
            "{container:?} cannot lead a volume identifier: it contains '/'"
        )));
    }
    Ok(())
}

/// Split an identifier into `(container, prefix)` on its first `/`.
///
/// The prefix is empty when the identifier contains no `/`.
pub fn decode(id: &VolumeId) -> (&str, &str) {
    id.0.split_once('/').unwrap_or((id.0.as_str(), ""))
}
