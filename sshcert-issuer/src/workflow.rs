use std::sync::Arc;

use sshcert_core::error::Stage;
use sshcert_core::record::fields;
use sshcert_core::{
    CertificateAuthority, IssueError, IssuedCertificateRecord, KeyMaterial, PendingRequestHandle,
    ProjectionError, PublicKeyMethod, RawCertificateResponse, RecordProjector, RetrieveRequest,
    SigningRequest, StateSink, ValidatedRequest, ValidationError,
};
use sshcert_keygen::{KeyGenerator, resolve_key_size};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::IssuanceSettings;
use crate::poll::retrieve_until_issued;
use crate::reconcile::reconcile;

/// Drives one request at a time through issuance.
///
/// The authority is shared; a workflow holds no per-issuance state, so one
/// instance may serve concurrent issuances.
pub struct IssuanceWorkflow {
    authority: Arc<dyn CertificateAuthority>,
    keygen: Arc<dyn KeyGenerator>,
    settings: IssuanceSettings,
    projector: RecordProjector,
}

impl IssuanceWorkflow {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        keygen: Arc<dyn KeyGenerator>,
        settings: IssuanceSettings,
    ) -> Self {
        Self {
            authority,
            keygen,
            settings,
            projector: RecordProjector,
        }
    }

    pub fn settings(&self) -> &IssuanceSettings {
        &self.settings
    }

    /// Issue a certificate for `request` and project it into `sink`.
    ///
    /// The pickup handle is written with [`StateSink::set_id`] as soon as
    /// the authority accepts the request.  Fields are only written once the
    /// whole record is available.
    pub async fn issue(
        &self,
        request: &ValidatedRequest,
        sink: &mut dyn StateSink,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificateRecord, IssueError> {
        let key_id = request.request().key_id.clone();
        self.run(request, None, sink, cancel)
            .await
            .inspect_err(|e| log_failure(&key_id, e))
    }

    /// Pick up a request submitted earlier, without submitting again.
    ///
    /// `local` is the key pair kept from the original attempt, usually read
    /// back from persisted state.  It fills the authority's empty private key
    /// exactly as during [`issue`](Self::issue).  Without it a
    /// [`PublicKeyMethod::Local`] issuance yields the authority's key fields.
    pub async fn resume(
        &self,
        request: &ValidatedRequest,
        handle: PendingRequestHandle,
        local: Option<KeyMaterial>,
        sink: &mut dyn StateSink,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificateRecord, IssueError> {
        let key_id = request.request().key_id.clone();
        if request.method() == PublicKeyMethod::Local && local.is_none() {
            warn!(
                %key_id,
                %handle,
                "resuming a locally generated key: the private key from the original attempt is not available"
            );
        }
        self.run(request, Some((handle, local)), sink, cancel)
            .await
            .inspect_err(|e| log_failure(&key_id, e))
    }

    async fn run(
        &self,
        request: &ValidatedRequest,
        resume: Option<(PendingRequestHandle, Option<KeyMaterial>)>,
        sink: &mut dyn StateSink,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificateRecord, IssueError> {
        let method = request.method();
        let key_id = request.request().key_id.as_str();

        let (signing_request, local, handle) = match resume {
            Some((handle, local)) => {
                debug!(
                    %key_id,
                    %handle,
                    stored_key = local.is_some(),
                    stage = %Stage::AwaitingPickup,
                    "resuming pickup"
                );
                let mut signing_request = request.request().clone();
                if let (PublicKeyMethod::Local, Some(k)) = (method, &local) {
                    signing_request.public_key = k.public_key.clone();
                }
                (signing_request, local, handle)
            }
            None => {
                debug!(%key_id, %method, stage = %Stage::SourcingPublicKey, "sourcing public key");
                let (signing_request, local) = self.source_public_key(request).await?;

                if cancel.is_cancelled() {
                    return Err(IssueError::Cancelled {
                        stage: Stage::SourcingPublicKey,
                        handle: None,
                    });
                }

                let handle = self.submit(&signing_request, sink).await?;
                (signing_request, local, handle)
            }
        };

        debug!(%key_id, %handle, stage = %Stage::AwaitingPickup, "waiting for certificate");
        let raw = self.retrieve(&handle, request.passphrase(), cancel).await?;

        debug!(%key_id, %handle, stage = %Stage::Reconciling, "reconciling key material");
        let record = reconcile(
            &handle,
            &signing_request,
            &raw,
            local.as_ref(),
            method,
            request.windows(),
        );

        self.projector.project(&record, sink)?;
        info!(
            %key_id,
            %handle,
            serial = %record.serial,
            valid_to = %record.valid_to,
            stage = %Stage::Completed,
            "certificate issued"
        );
        Ok(record)
    }

    /// Produce the request actually sent to the authority, plus the key pair
    /// when it is generated here.
    async fn source_public_key(
        &self,
        request: &ValidatedRequest,
    ) -> Result<(SigningRequest, Option<KeyMaterial>), IssueError> {
        let mut signing_request = request.request().clone();

        match request.method() {
            PublicKeyMethod::Local => {
                let size_bits = resolve_key_size(signing_request.key_size);
                if signing_request.key_size.is_none_or(|s| s <= 0) {
                    debug!(size_bits, "no positive key size requested, using default");
                }

                let keygen = Arc::clone(&self.keygen);
                let passphrase = request.passphrase().map(|p| Zeroizing::new(p.to_string()));
                let comment = signing_request.key_id.clone();
                let material = tokio::task::spawn_blocking(move || {
                    keygen.generate(size_bits, passphrase.as_deref().map(String::as_str), &comment)
                })
                .await
                .map_err(|e| IssueError::KeyGeneration {
                    source: Box::new(e),
                })?
                .map_err(|e| IssueError::KeyGeneration {
                    source: Box::new(e),
                })?;

                signing_request.public_key = material.public_key.clone();
                Ok((signing_request, Some(material)))
            }
            PublicKeyMethod::File => {
                if signing_request.public_key.trim().is_empty() {
                    return Err(ValidationError::EmptyPublicKey.into());
                }
                Ok((signing_request, None))
            }
            PublicKeyMethod::Service => {
                signing_request.public_key.clear();
                Ok((signing_request, None))
            }
        }
    }

    /// Submit once and checkpoint the handle.  Never retried.
    async fn submit(
        &self,
        signing_request: &SigningRequest,
        sink: &mut dyn StateSink,
    ) -> Result<PendingRequestHandle, IssueError> {
        let handle = self
            .authority
            .submit(signing_request)
            .await
            .map_err(|source| IssueError::Submission { source })?;

        info!(
            key_id = %signing_request.key_id,
            %handle,
            authority = self.authority.kind(),
            stage = %Stage::Submitted,
            "certificate request submitted"
        );

        sink.set_id(handle.as_str())
            .map_err(|e| IssueError::Checkpoint {
                handle: handle.clone(),
                source: ProjectionError::new(fields::ID, e),
            })?;
        Ok(handle)
    }

    /// Bounded pickup of `handle` using the configured timing.
    pub async fn retrieve(
        &self,
        handle: &PendingRequestHandle,
        passphrase: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RawCertificateResponse, IssueError> {
        let retrieve_request = RetrieveRequest {
            handle: handle.clone(),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
            include_details: true,
            timeout: self.settings.retrieve_timeout,
        };
        retrieve_until_issued(
            self.authority.as_ref(),
            &retrieve_request,
            self.settings.retrieve_timeout,
            self.settings.poll_interval,
            cancel,
        )
        .await
    }
}

fn log_failure(key_id: &str, err: &IssueError) {
    match err.pending_handle() {
        Some(handle) => warn!(
            %key_id,
            %handle,
            stage = %err.stage(),
            resumable = err.is_resumable(),
            error = %err,
            "issuance failed"
        ),
        None => warn!(%key_id, stage = %err.stage(), error = %err, "issuance failed"),
    }
}
