//! Exponential backoff helpers shared by the queues and external
//! collaborators.

use std::time::Duration;

/// Stage-job retry delay: `min(3600, 2^(attempts-1) * 30)` seconds.
#[must_use]
pub fn stage_job_backoff(attempts: i64) -> Duration {
    let exp = attempts.saturating_sub(1).clamp(0, 20) as u32;
    Duration::from_secs((2u64.saturating_pow(exp) * 30).min(3600))
}

/// Generic-job retry delay: `min(900, 2^attempts * 10)` seconds.
#[must_use]
pub fn generic_job_backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 20) as u32;
    Duration::from_secs((2u64.saturating_pow(exp) * 10).min(900))
}

/// Retry an async operation with exponential backoff between attempts.
///
/// Used for external collaborators (email, storage) where transient failures
/// must not bubble into orchestration. Returns the last error when all
/// attempts fail.
pub async fn with_retry<T, E, F, Fut>(
    max_attempts: u32,
    min_wait: Duration,
    max_wait: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut wait = min_wait;
    let mut last_err = None;
    for attempt in 0..max_attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt + 1 < max_attempts {
                    tokio::time::sleep(wait).await;
                    wait = (wait * 2).min(max_wait);
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn stage_backoff_caps_at_one_hour() {
        assert_eq!(stage_job_backoff(1), Duration::from_secs(30));
        assert_eq!(stage_job_backoff(2), Duration::from_secs(60));
        assert_eq!(stage_job_backoff(3), Duration::from_secs(120));
        assert_eq!(stage_job_backoff(50), Duration::from_secs(3600));
        assert_eq!(stage_job_backoff(0), Duration::from_secs(30));
    }

    #[test]
    fn generic_backoff_caps_at_fifteen_minutes() {
        assert_eq!(generic_job_backoff(0), Duration::from_secs(10));
        assert_eq!(generic_job_backoff(1), Duration::from_secs(20));
        assert_eq!(generic_job_backoff(3), Duration::from_secs(80));
        assert_eq!(generic_job_backoff(30), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err("transient") } else { Ok(n) } }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_last_error() {
        let result: Result<(), &str> = with_retry(
            2,
            Duration::from_millis(1),
            Duration::from_millis(1),
            || async { Err("still down") },
        )
        .await;
        assert_eq!(result, Err("still down"));
    }
}
