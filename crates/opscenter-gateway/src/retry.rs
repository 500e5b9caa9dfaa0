//! Backoff for transient gateway errors.

use crate::gateway::{GatewayError, GatewayResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const MAX_ATTEMPTS: u32 = 3;

/// Run `op`, retrying transient failures with exponential backoff.
/// Fatal errors propagate immediately; a rate-limit error waits the hinted
/// delay (capped at 30 s) instead of the backoff step.
pub async fn with_backoff<T, F, Fut>(what: &str, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(
                    "{} failed (attempt {}/{}): {} — retrying",
                    what, attempt, MAX_ATTEMPTS, e
                );
                let wait = match &e {
                    GatewayError::RateLimited { retry_after_ms } => {
                        Duration::from_millis(*retry_after_ms).min(Duration::from_secs(30))
                    }
                    _ => delay,
                };
                tokio::time::sleep(wait).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::RequestFailed("503".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Stream("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = with_backoff("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::AuthFailed("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::AuthFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_is_not_transient() {
        assert!(!GatewayError::Cancelled.is_transient());
        assert!(!GatewayError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(GatewayError::RateLimited { retry_after_ms: 10 }.is_transient());
    }
}
