//! Error taxonomy for certificate issuance.
//!
//! Every failure names the stage it happened in.  Failures after submission
//! also carry the [`PendingRequestHandle`] so the caller can resume pickup
//! without submitting a second request.

use std::fmt;
use std::time::Duration;

use crate::{CaError, PendingRequestHandle};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Workflow stages, in the order an issuance moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validating,
    SourcingPublicKey,
    Submitted,
    AwaitingPickup,
    Reconciling,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::SourcingPublicKey => "sourcing_public_key",
            Self::Submitted => "submitted",
            Self::AwaitingPickup => "awaiting_pickup",
            Self::Reconciling => "reconciling",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cross-field constraint violations, detected before any side effect.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("`principal` and `principals` are mutually exclusive; use `principals`")]
    ConflictingPrincipals,
    #[error("public key is empty (required when public_key_method = \"file\")")]
    EmptyPublicKey,
}

/// A derived field could not be written to the persisted state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to persist field `{field}`: {message}")]
pub struct ProjectionError {
    pub field: String,
    pub message: String,
}

impl ProjectionError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IssueError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("key generation failed: {source}")]
    KeyGeneration {
        #[source]
        source: BoxError,
    },

    #[error("certificate request submission failed: {source}")]
    Submission {
        #[source]
        source: CaError,
    },

    #[error("request {handle} was accepted but its handle could not be saved: {source}")]
    Checkpoint {
        handle: PendingRequestHandle,
        #[source]
        source: ProjectionError,
    },

    #[error("certificate {handle} was not issued within {waited:?}")]
    RetrievalTimeout {
        handle: PendingRequestHandle,
        waited: Duration,
    },

    #[error("failed to retrieve certificate {handle}: {source}")]
    Retrieval {
        handle: PendingRequestHandle,
        #[source]
        source: CaError,
    },

    #[error("issuance cancelled while {stage}")]
    Cancelled {
        stage: Stage,
        handle: Option<PendingRequestHandle>,
    },

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

impl IssueError {
    /// The stage the workflow was in when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Validation(_) => Stage::Validating,
            Self::KeyGeneration { .. } => Stage::SourcingPublicKey,
            Self::Submission { .. } | Self::Checkpoint { .. } => Stage::Submitted,
            Self::RetrievalTimeout { .. } | Self::Retrieval { .. } => Stage::AwaitingPickup,
            Self::Cancelled { stage, .. } => *stage,
            Self::Projection(_) => Stage::Reconciling,
        }
    }

    /// The pickup handle, if the request got as far as being accepted.
    pub fn pending_handle(&self) -> Option<&PendingRequestHandle> {
        match self {
            Self::Checkpoint { handle, .. }
            | Self::RetrievalTimeout { handle, .. }
            | Self::Retrieval { handle, .. } => Some(handle),
            Self::Cancelled { handle, .. } => handle.as_ref(),
            _ => None,
        }
    }

    /// Whether a later pickup attempt for the same handle may still succeed.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint { .. }
                | Self::RetrievalTimeout { .. }
                | Self::Cancelled {
                    handle: Some(_),
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_preserves_handle() {
        let err = IssueError::RetrievalTimeout {
            handle: PendingRequestHandle::new("\\VED\\Certificates\\svc1"),
            waited: Duration::from_secs(10),
        };
        assert_eq!(err.stage(), Stage::AwaitingPickup);
        assert_eq!(
            err.pending_handle().map(PendingRequestHandle::as_str),
            Some("\\VED\\Certificates\\svc1")
        );
        assert!(err.is_resumable());
    }

    #[test]
    fn submission_failure_has_no_handle() {
        let err = IssueError::Submission {
            source: CaError::Rejected("template not found".to_string()),
        };
        assert_eq!(err.stage(), Stage::Submitted);
        assert!(err.pending_handle().is_none());
        assert!(!err.is_resumable());
        assert!(err.to_string().contains("template not found"));
    }

    #[test]
    fn retrieval_failure_is_not_resumable() {
        let err = IssueError::Retrieval {
            handle: PendingRequestHandle::new("dn"),
            source: CaError::Rejected("Rejected".to_string()),
        };
        assert!(err.pending_handle().is_some());
        assert!(!err.is_resumable());
    }

    #[test]
    fn validation_errors_report_validating_stage() {
        let err = IssueError::from(ValidationError::EmptyPublicKey);
        assert_eq!(err.stage(), Stage::Validating);
    }

    #[test]
    fn projection_failure_reports_reconciling_stage() {
        let err = IssueError::from(ProjectionError::new("private_key", "rejected"));
        assert_eq!(err.stage(), Stage::Reconciling);
        assert!(err.pending_handle().is_none());
    }

    #[test]
    fn projection_error_names_field() {
        let err = ProjectionError::new("signing_ca", "value rejected");
        assert_eq!(
            err.to_string(),
            "failed to persist field `signing_ca`: value rejected"
        );
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::AwaitingPickup.to_string(), "awaiting_pickup");
        assert_eq!(Stage::SourcingPublicKey.to_string(), "sourcing_public_key");
    }
}
