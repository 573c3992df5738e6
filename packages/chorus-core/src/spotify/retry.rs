//! Retry logic for transient provider errors.
//!
//! Metadata fetches that fail with timeouts, rate limits, or 5xx
//! responses get a couple of spaced re-attempts. Player commands are
//! never retried here; the reconciliation loop's next tick is their
//! retry.

use std::time::Duration;

use super::api::SpotifyResult;

/// Total attempts per request, the first one included.
const MAX_ATTEMPTS: u32 = 3;

/// Wait between attempts grows by this step (250ms, then 500ms).
const BACKOFF_STEP_MS: u64 = 250;

/// Executes a provider request, re-attempting transient failures.
///
/// Permanent errors and the final transient failure are returned to the
/// caller as-is.
///
/// # Arguments
/// * `action` - Action name for logging
/// * `operation` - Closure that performs the request
pub(crate) async fn with_retry<T, F, Fut>(action: &str, mut operation: F) -> SpotifyResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SpotifyResult<T>>,
{
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() || attempt >= MAX_ATTEMPTS {
            return Err(error);
        }

        let delay = Duration::from_millis(BACKOFF_STEP_MS * u64::from(attempt));
        log::warn!(
            "[Spotify] {} hit a transient failure ({}), re-attempting in {}ms ({}/{})",
            action,
            error,
            delay.as_millis(),
            attempt + 1,
            MAX_ATTEMPTS
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spotify::api::SpotifyError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, SpotifyError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let result: SpotifyResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SpotifyError::NotFound) }
        })
        .await;
        assert!(matches!(result, Err(SpotifyError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SpotifyError::Api(503, "unavailable".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: SpotifyResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SpotifyError::Api(503, "still down".into())) }
        })
        .await;
        assert!(matches!(result, Err(SpotifyError::Api(503, _))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    }
}
