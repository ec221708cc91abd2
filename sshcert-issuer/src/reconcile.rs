//! Merge of locally held key material with the authority's response.

use sshcert_core::timecodec;
use sshcert_core::{
    IssuedCertificateRecord, KeyMaterial, PendingRequestHandle, PublicKeyMethod,
    RawCertificateResponse, SigningRequest,
};
use sshcert_keygen::normalize_line_endings;
use zeroize::Zeroizing;

/// Tag prepended to bare SHA-256 fingerprint values.
pub const FINGERPRINT_PREFIX: &str = "SHA256:";

/// Build the issued record from a pickup response.
///
/// - An empty private key in the response is replaced by the local one.
/// - With [`PublicKeyMethod::Local`] the locally generated public key wins
///   over whatever the authority echoes back.
/// - A service-generated private key has `\r\n` turned into `\n` unless
///   `windows` is set.  Local and file keys are never rewritten.
///
/// Pure: identical inputs give identical records.
pub fn reconcile(
    identity: &PendingRequestHandle,
    request: &SigningRequest,
    raw: &RawCertificateResponse,
    local: Option<&KeyMaterial>,
    method: PublicKeyMethod,
    windows: bool,
) -> IssuedCertificateRecord {
    let private_key = if raw.private_key.is_empty() {
        local
            .map(|k| k.private_key.clone())
            .unwrap_or_default()
    } else if method == PublicKeyMethod::Service && !windows {
        Zeroizing::new(normalize_line_endings(&raw.private_key))
    } else {
        raw.private_key.clone()
    };

    let public_key = match (method, local) {
        (PublicKeyMethod::Local, Some(k)) => k.public_key.clone(),
        _ => raw.public_key.clone(),
    };

    IssuedCertificateRecord {
        identity: identity.clone(),
        request: request.clone(),
        certificate: raw.certificate.clone(),
        certificate_type: raw.details.certificate_type.clone(),
        public_key,
        private_key,
        public_key_fingerprint: format!(
            "{FINGERPRINT_PREFIX}{}",
            raw.details.public_key_fingerprint_sha256
        ),
        signing_ca: format!("{FINGERPRINT_PREFIX}{}", raw.details.ca_fingerprint_sha256),
        serial: raw.details.serial_number.clone(),
        valid_from: timecodec::render_seconds(raw.details.valid_from),
        valid_to: timecodec::render_seconds(raw.details.valid_to),
    }
}
