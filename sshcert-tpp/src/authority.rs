//! [`CertificateAuthority`] implementation on top of [`TppClient`].

use std::collections::BTreeMap;

use sshcert_core::{
    CaError, CertificateAuthority, CertificateDetails, PendingRequestHandle,
    RawCertificateResponse, RetrievalStatus, RetrieveRequest, SigningRequest,
};
use tracing::{debug, warn};

use crate::api::{
    self, CertificateRequestBody, CertificateRetrieveResponse, TEMPLATE_ROOT, TppClient, TppConfig,
};
use crate::error::TppError;

/// Processing states that end a request without a certificate.
const FAILED_STATUSES: &[&str] = &["rejected", "failed", "error"];

pub struct TppAuthority {
    client: TppClient,
}

impl TppAuthority {
    pub fn new(config: TppConfig) -> Result<Self, TppError> {
        Ok(Self {
            client: TppClient::new(config)?,
        })
    }
}

#[async_trait::async_trait]
impl CertificateAuthority for TppAuthority {
    fn kind(&self) -> &str {
        "tpp"
    }

    async fn submit(&self, request: &SigningRequest) -> Result<PendingRequestHandle, CaError> {
        let body = build_request_body(request);
        let dn = self.client.request_certificate(&body).await?;
        Ok(PendingRequestHandle::new(dn))
    }

    async fn retrieve(&self, request: &RetrieveRequest) -> Result<RetrievalStatus, CaError> {
        let resp = self
            .client
            .retrieve_certificate(
                request.handle.as_str(),
                request.passphrase.as_deref().map(String::as_str),
                request.include_details,
                Some(request.timeout),
            )
            .await?;
        Ok(classify(resp)?)
    }
}

/// Full template DN for `template`.
pub fn template_dn(template: &str) -> String {
    if template.starts_with(TEMPLATE_ROOT) {
        template.to_string()
    } else {
        format!("{TEMPLATE_ROOT}{template}")
    }
}

/// Split `key:value` extensions; a bare name maps to an empty value.
pub fn extension_map(extensions: &[String]) -> BTreeMap<String, String> {
    extensions
        .iter()
        .filter(|e| !e.is_empty())
        .map(|e| match e.split_once(':') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (e.clone(), String::new()),
        })
        .collect()
}

pub fn build_request_body(request: &SigningRequest) -> CertificateRequestBody {
    CertificateRequestBody {
        ca_dn: template_dn(&request.template),
        policy_dn: request.folder.clone(),
        object_name: request.object_name.clone(),
        destination_addresses: request.destination_addresses.clone(),
        key_id: request.key_id.clone(),
        principals: request.principals.clone(),
        validity_period: request
            .valid_hours
            .filter(|h| *h > 0)
            .map(|h| format!("{h}h")),
        public_key_data: Some(request.public_key.clone()).filter(|k| !k.is_empty()),
        extensions: extension_map(&request.extensions),
        force_command: request.force_command.clone(),
        source_addresses: request.source_addresses.clone(),
    }
}

/// Interpret one retrieve reply.
///
/// Certificate data present means issued.  A failed processing status, or an
/// unsuccessful reply without any processing details, is an error.  Anything
/// else is still being worked on.
pub fn classify(resp: CertificateRetrieveResponse) -> Result<RetrievalStatus, TppError> {
    if !resp.certificate_data.is_empty() {
        let details = resp.certificate_details.unwrap_or_default();
        return Ok(RetrievalStatus::Issued(RawCertificateResponse {
            certificate: resp.certificate_data,
            public_key: resp.public_key_data,
            private_key: resp.private_key_data,
            details: CertificateDetails {
                certificate_type: details.certificate_type,
                public_key_fingerprint_sha256: details.public_key_fingerprint_sha256,
                ca_fingerprint_sha256: details.ca_fingerprint_sha256,
                serial_number: details.serial_number,
                valid_from: details.valid_from,
                valid_to: details.valid_to,
            },
        }));
    }

    match &resp.processing_details {
        Some(p) if FAILED_STATUSES.contains(&p.status.to_ascii_lowercase().as_str()) => {
            warn!(status = %p.status, "SSH certificate processing failed");
            let reason = if p.status_description.is_empty() {
                p.status.clone()
            } else {
                format!("{}: {}", p.status, p.status_description)
            };
            Err(TppError::Rejected(reason))
        }
        None if !resp.response.success => Err(TppError::Api(api::describe(&resp.response))),
        other => {
            debug!(
                status = other.as_ref().map(|p| p.status.as_str()).unwrap_or(""),
                "SSH certificate not issued yet"
            );
            Ok(RetrievalStatus::Pending)
        }
    }
}
