//! Cooperative bounded polling
//!
//! One waiting discipline serves both propagation confirmation (DNS/HTTP
//! visibility before notifying the server) and ACME resource-status
//! polling (order finalization, challenge validation); only the
//! predicate differs.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::AcmeError;

/// Outcome of a failed predicate invocation
#[derive(Debug)]
pub enum CheckError {
    /// Recorded for diagnostics; polling continues
    Transient(AcmeError),
    /// Polling stops immediately with this error
    Fatal(AcmeError),
}

/// Poll `check` until it reports done, reports a fatal error, or the
/// timeout elapses - whichever comes first
///
/// The predicate is invoked immediately, then on the fixed interval. It
/// is invoked at least once even when the timeout is smaller than the
/// interval, and never after the deadline has passed. On timeout the
/// most recent transient error is carried in the returned
/// `PropagationTimeout` for diagnostics.
pub async fn wait_for<F, Fut>(
    label: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<(), AcmeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, CheckError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last_error: Option<AcmeError> = None;

    trace!(label = %label, timeout_secs = timeout.as_secs(), "Waiting");

    loop {
        match check().await {
            Ok(true) => {
                debug!(
                    label = %label,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Condition met"
                );
                return Ok(());
            }
            Ok(false) => {
                trace!(label = %label, "Not ready yet");
            }
            Err(CheckError::Fatal(error)) => return Err(error),
            Err(CheckError::Transient(error)) => {
                debug!(label = %label, error = %error, "Check failed, will retry");
                last_error = Some(error);
            }
        }

        // The next invocation would land past the deadline; give up now
        // rather than fire a check the caller no longer wants.
        if Instant::now() + interval > deadline {
            return Err(AcmeError::PropagationTimeout {
                label: label.to_string(),
                last_error: last_error.map(Box::new),
            });
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for("immediate", Duration::from_secs(10), Duration::from_secs(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoked_once_when_timeout_shorter_than_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for("short", Duration::from_secs(1), Duration::from_secs(30), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        assert!(matches!(result, Err(AcmeError::PropagationTimeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_invoked_after_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for("bounded", Duration::from_secs(10), Duration::from_secs(3), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
        })
        .await;

        assert!(result.is_err());
        // Invocations land at t=0, 3, 6, 9; t=12 is past the deadline
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for("eventual", Duration::from_secs(60), Duration::from_secs(2), || {
            let counter = Arc::clone(&counter);
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = wait_for("fatal", Duration::from_secs(60), Duration::from_secs(1), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CheckError::Fatal(AcmeError::OrderFailed {
                    detail: "order became invalid".to_string(),
                }))
            }
        })
        .await;

        assert!(matches!(result, Err(AcmeError::OrderFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_transient_error() {
        let result = wait_for("diagnosed", Duration::from_secs(3), Duration::from_secs(2), || async {
            Err(CheckError::Transient(AcmeError::Dns {
                name: "_acme-challenge.example.com.".to_string(),
                message: "SERVFAIL".to_string(),
            }))
        })
        .await;

        match result {
            Err(AcmeError::PropagationTimeout { label, last_error }) => {
                assert_eq!(label, "diagnosed");
                let inner = last_error.expect("last error should be carried");
                assert!(inner.to_string().contains("SERVFAIL"));
            }
            other => panic!("expected PropagationTimeout, got {:?}", other),
        }
    }
}
