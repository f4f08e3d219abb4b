//! # Domain Invariants

use super::errors::BatchError;
use shared_types::DataVersion;

/// Invariant: an update is accepted iff its base version equals the
/// owner's current version.
pub fn check_base_version(base: DataVersion, current: DataVersion) -> Result<(), BatchError> {
    if base != current {
        return Err(BatchError::VersionConflict { base, current });
    }
    Ok(())
}
