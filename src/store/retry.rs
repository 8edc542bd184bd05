use {
    crate::{metrics::STORE_ERRORS, store::StoreError},
    log::warn,
    std::{future::Future, time::Duration},
    tokio::time::sleep,
};

/// Bounded exponential backoff for store round-trips.
///
/// Only wrap operations that are safe to repeat: reads, absolute writes and
/// connection checkout. `INCR`, `DECR` and `PUBLISH` run once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        backoff: Duration::ZERO,
    };

    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }

    pub async fn run<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Unavailable(reason)) if attempt < self.retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        "Store {op} failed on attempt {}: {reason}; retrying in {delay:?}",
                        attempt + 1
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    STORE_ERRORS.with_label_values(&[op]).inc();
                    return Err(error);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(50))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_unavailable_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::new(2, Duration::from_millis(10))
            .run("get", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::new(1, Duration::from_millis(10))
            .run("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("get", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Malformed {
                    key: "k".into(),
                    value: "x".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
