//! Issuance workflow for SSH certificates.
//!
//! ```text
//! Validating → SourcingPublicKey → Submitted → AwaitingPickup → Reconciling → Completed
//! ```
//!
//! [`IssuanceWorkflow`] drives a [`ValidatedRequest`](sshcert_core::ValidatedRequest)
//! through these stages against a shared
//! [`CertificateAuthority`](sshcert_core::CertificateAuthority).  The pickup
//! handle is checkpointed as soon as the authority accepts the request, so a
//! failed or interrupted pickup can be resumed without a second submission.

use std::time::Duration;

use sshcert_core::config::IssuanceConfig;

pub mod poll;
pub mod reconcile;
pub mod workflow;

pub use reconcile::reconcile;
pub use workflow::IssuanceWorkflow;

/// Default pickup budget.
pub const DEFAULT_RETRIEVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between pickup attempts while the certificate is pending.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timing of the pickup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuanceSettings {
    /// Total time allowed for pickup, across all attempts.
    pub retrieve_timeout: Duration,
    /// Delay after a pending reply before trying again.
    pub poll_interval: Duration,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            retrieve_timeout: DEFAULT_RETRIEVE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl From<&IssuanceConfig> for IssuanceSettings {
    fn from(config: &IssuanceConfig) -> Self {
        Self {
            retrieve_timeout: config.retrieve_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}
