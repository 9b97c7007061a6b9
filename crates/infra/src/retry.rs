//! Bounded retries for transient storage failures.

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

use crate::jobs::types::RetryPolicy;

/// Errors that can tell whether another attempt may succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for crate::store::StoreError {
    fn is_transient(&self) -> bool {
        crate::store::StoreError::is_transient(self)
    }
}

impl Retryable for crate::company::ResolveError {
    fn is_transient(&self) -> bool {
        matches!(self, crate::company::ResolveError::Store(e) if e.is_transient())
    }
}

/// Run `op` until it succeeds, fails permanently, or `policy` runs out of
/// attempts. Only transient errors are retried.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &'static str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient storage error; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
