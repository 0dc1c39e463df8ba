// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// Errors produced by the reconciliation core and the resource store.
#[allow(clippy::result_large_err)]
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("resource {0} not found")]
    NotFound(String),

    #[error("resource {0} already exists")]
    AlreadyExists(String),

    #[error("version conflict on {resource}: wrote {submitted}, stored {stored}")]
    VersionConflict {
        resource: String,
        submitted: u64,
        stored: u64,
    },

    #[error("phase changed on {0} between read and write")]
    PhaseConflict(String),

    #[error("owner conflict on {resource}: owned by {owner:?}, written by {writer:?}")]
    OwnerConflict {
        resource: String,
        owner: String,
        writer: String,
    },

    #[error("resource {0} is tearing down")]
    TearingDown(String),

    #[error("resource {0} still has finalizers")]
    PendingFinalizers(String),

    #[error("API request failed: {0}")]
    Api(#[from] tonic::Status),

    #[error("configuration generation failed: {0}")]
    Generation(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl FleetError {
    /// True for store reads that came back empty.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }

    /// True when a write raced a concurrent update and should be retried.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, FleetError::VersionConflict { .. })
    }

    /// True when the resource phase flipped between read and write.
    ///
    /// Controllers treat this as a benign race: the watch delivers another
    /// event for the new phase and the next reconcile picks it up.
    #[must_use]
    pub fn is_phase_conflict(&self) -> bool {
        matches!(self, FleetError::PhaseConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
