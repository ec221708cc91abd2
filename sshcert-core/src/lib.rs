use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod config;
pub mod error;
pub mod params;
pub mod record;
pub mod store;
pub mod timecodec;

pub use error::{IssueError, ProjectionError, Stage, ValidationError};
pub use params::{RequestParams, ValidatedRequest};
pub use record::{IssuedCertificateRecord, RecordProjector, ResourceState, StateSink};

/// Crate-wide mutex used by tests that mutate `XDG_DATA_HOME`.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// How the public half of the certified key pair is obtained.
///
/// Fixed for the lifetime of a single issuance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicKeyMethod {
    /// The key pair is generated locally before submission.
    #[default]
    Local,
    /// The caller supplies an existing public key.
    File,
    /// The authority generates the key pair and returns both halves.
    Service,
}

impl PublicKeyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::File => "file",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for PublicKeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signing request as submitted to the certificate authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub key_id: String,
    pub template: String,
    pub folder: Option<String>,
    pub force_command: Option<String>,
    /// Requested key size as given by the caller.  Values `<= 0` mean "use
    /// the default" and are resolved by the workflow.
    pub key_size: Option<i64>,
    pub valid_hours: Option<u32>,
    pub object_name: Option<String>,
    /// OpenSSH `authorized_keys` line.  Empty only for service-generated keys.
    pub public_key: String,
    pub principals: Vec<String>,
    pub source_addresses: Vec<String>,
    pub destination_addresses: Vec<String>,
    pub extensions: Vec<String>,
}

/// Pickup identifier (a distinguished name) returned by the authority when a
/// request is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingRequestHandle(String);

impl PendingRequestHandle {
    pub fn new(dn: impl Into<String>) -> Self {
        Self(dn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PendingRequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A freshly generated key pair.
///
/// The private key may be passphrase-encrypted and is zeroized on drop.
#[derive(Clone, Default)]
pub struct KeyMaterial {
    pub private_key: Zeroizing<String>,
    pub public_key: String,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("private_key", &"[redacted]")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Structured certificate metadata reported by the authority.
///
/// Fingerprints are the bare digest value without an algorithm tag; validity
/// bounds are Unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateDetails {
    pub certificate_type: String,
    pub public_key_fingerprint_sha256: String,
    pub ca_fingerprint_sha256: String,
    pub serial_number: String,
    pub valid_from: i64,
    pub valid_to: i64,
}

/// A signed certificate as returned by the authority, before reconciliation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawCertificateResponse {
    pub certificate: String,
    pub public_key: String,
    /// Empty unless the authority generated the key pair.
    pub private_key: Zeroizing<String>,
    pub details: CertificateDetails,
}

impl fmt::Debug for RawCertificateResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let private_key = if self.private_key.is_empty() {
            "[empty]"
        } else {
            "[redacted]"
        };
        f.debug_struct("RawCertificateResponse")
            .field("certificate", &self.certificate)
            .field("public_key", &self.public_key)
            .field("private_key", &private_key)
            .field("details", &self.details)
            .finish()
    }
}

/// Parameters for a single pickup attempt.
#[derive(Clone)]
pub struct RetrieveRequest {
    pub handle: PendingRequestHandle,
    /// Passphrase the authority uses to encrypt a service-generated private key.
    pub passphrase: Option<Zeroizing<String>>,
    pub include_details: bool,
    /// Upper bound a transport may block for on this attempt.
    pub timeout: Duration,
}

impl fmt::Debug for RetrieveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveRequest")
            .field("handle", &self.handle)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[redacted]"))
            .field("include_details", &self.include_details)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Outcome of a single pickup attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalStatus {
    /// The authority has not finished issuing the certificate yet.
    Pending,
    Issued(RawCertificateResponse),
}

#[derive(thiserror::Error, Debug)]
pub enum CaError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request rejected by authority: {0}")]
    Rejected(String),
    #[error("authority unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Connection to a certificate authority able to sign SSH keys.
///
/// Implementations must be safe to share between concurrently running
/// issuances; the process builds one and hands an `Arc` to every workflow.
#[async_trait::async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Short identifier of the authority kind (e.g. `"tpp"`), used in logs.
    fn kind(&self) -> &str;

    /// Submit a signing request.  Never retried by callers: a repeated
    /// submission may issue a second certificate.
    async fn submit(&self, request: &SigningRequest) -> Result<PendingRequestHandle, CaError>;

    /// Make one pickup attempt for a previously submitted request.
    async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrievalStatus, CaError>;
}
