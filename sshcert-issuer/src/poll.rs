//! Bounded, cancellable pickup of a submitted certificate request.

use std::time::Duration;

use sshcert_core::error::Stage;
use sshcert_core::{
    CaError, CertificateAuthority, IssueError, RawCertificateResponse, RetrievalStatus,
    RetrieveRequest,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Floor for the delay between attempts; a zero interval would spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Retrieve `request.handle` until the authority reports it issued.
///
/// Pending replies are retried every `poll_interval` (the last sleep is cut
/// short at the deadline) until `budget` is spent.  An attempt still in
/// flight at the deadline is dropped.  Cancelling `cancel` aborts the wait at
/// once.  Every failure carries the handle.
pub async fn retrieve_until_issued(
    authority: &dyn CertificateAuthority,
    request: &RetrieveRequest,
    budget: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<RawCertificateResponse, IssueError> {
    let handle = request.handle.clone();
    let deadline = Instant::now() + budget;
    let interval = poll_interval.max(MIN_POLL_INTERVAL);

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(%handle, "pickup cancelled");
            return Err(IssueError::Cancelled {
                stage: Stage::AwaitingPickup,
                handle: Some(handle),
            });
        }
        r = tokio::time::timeout_at(deadline, poll(authority, request, deadline, interval)) => r,
    };

    match outcome {
        Ok(Ok(Some(raw))) => Ok(raw),
        Ok(Ok(None)) | Err(_) => Err(IssueError::RetrievalTimeout {
            handle,
            waited: budget,
        }),
        Ok(Err(source)) => Err(IssueError::Retrieval { handle, source }),
    }
}

/// `Ok(None)` once a pending reply arrives at or after `deadline`.
async fn poll(
    authority: &dyn CertificateAuthority,
    request: &RetrieveRequest,
    deadline: Instant,
    interval: Duration,
) -> Result<Option<RawCertificateResponse>, CaError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match authority.retrieve(request).await? {
            RetrievalStatus::Issued(raw) => {
                debug!(handle = %request.handle, attempt, "certificate picked up");
                return Ok(Some(raw));
            }
            RetrievalStatus::Pending => {
                let now = Instant::now();
                if now >= deadline {
                    debug!(handle = %request.handle, attempt, "pickup budget spent");
                    return Ok(None);
                }
                debug!(handle = %request.handle, attempt, "certificate pending");
                tokio::time::sleep_until((now + interval).min(deadline)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sshcert_core::PendingRequestHandle;

    use super::*;

    /// Replies from a script, then `Pending` forever.  Optionally never
    /// answers at all.
    struct ScriptedAuthority {
        script: Mutex<VecDeque<Result<RetrievalStatus, CaError>>>,
        calls: AtomicUsize,
        hang: bool,
    }

    impl ScriptedAuthority {
        fn new(script: Vec<Result<RetrievalStatus, CaError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                hang: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CertificateAuthority for ScriptedAuthority {
        fn kind(&self) -> &str {
            "scripted"
        }

        async fn submit(
            &self,
            _request: &sshcert_core::SigningRequest,
        ) -> Result<PendingRequestHandle, CaError> {
            unreachable!("pickup never submits")
        }

        async fn retrieve(&self, _request: &RetrieveRequest) -> Result<RetrievalStatus, CaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(RetrievalStatus::Pending))
        }
    }

    fn request() -> RetrieveRequest {
        RetrieveRequest {
            handle: PendingRequestHandle::new("\\VED\\Certificates\\svc1"),
            passphrase: None,
            include_details: true,
            timeout: Duration::from_secs(10),
        }
    }

    fn issued(serial: &str) -> RetrievalStatus {
        RetrievalStatus::Issued(RawCertificateResponse {
            certificate: "cert".to_string(),
            details: sshcert_core::CertificateDetails {
                serial_number: serial.to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn pending_replies_are_retried_until_issued() {
        let ca = ScriptedAuthority::new(vec![
            Ok(RetrievalStatus::Pending),
            Ok(RetrievalStatus::Pending),
            Ok(issued("42")),
        ]);
        let start = Instant::now();
        let raw = retrieve_until_issued(
            &ca,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(raw.details.serial_number, "42");
        assert_eq!(ca.calls(), 3);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn always_pending_times_out_with_handle() {
        let ca = ScriptedAuthority::new(vec![]);
        let err = retrieve_until_issued(
            &ca,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            IssueError::RetrievalTimeout { handle, waited } => {
                assert_eq!(handle.as_str(), "\\VED\\Certificates\\svc1");
                assert_eq!(waited, Duration::from_secs(10));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // t = 0, 2, 4, 6, 8 and a final attempt at the deadline.
        assert_eq!(ca.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_is_dropped_at_deadline() {
        let mut ca = ScriptedAuthority::new(vec![]);
        ca.hang = true;
        let start = Instant::now();
        let err = retrieve_until_issued(
            &ca,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IssueError::RetrievalTimeout { .. }));
        assert_eq!(ca.calls(), 1);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn authority_failure_is_not_retried() {
        let ca = ScriptedAuthority::new(vec![
            Ok(RetrievalStatus::Pending),
            Err(CaError::Rejected("principal not allowed".to_string())),
        ]);
        let err = retrieve_until_issued(
            &ca,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            IssueError::Retrieval { source: CaError::Rejected(_), .. }
        ));
        assert_eq!(ca.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_wait() {
        let ca = ScriptedAuthority::new(vec![]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = retrieve_until_issued(
            &ca,
            &request(),
            Duration::from_secs(10),
            Duration::from_secs(2),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(err.is_resumable());
        match err {
            IssueError::Cancelled { stage, handle } => {
                assert_eq!(stage, Stage::AwaitingPickup);
                assert_eq!(handle.unwrap().as_str(), "\\VED\\Certificates\\svc1");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_floored() {
        let ca = ScriptedAuthority::new(vec![]);
        let err = retrieve_until_issued(
            &ca,
            &request(),
            Duration::from_secs(1),
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IssueError::RetrievalTimeout { .. }));
        // One attempt at t=0 and one per 100ms floor tick up to the deadline.
        assert_eq!(ca.calls(), 11);
    }
}
