//! Bounded retry of a single provider call.

use std::future::Future;

use tokio::time::sleep;
use tracing::warn;

use crate::backoff::Backoff;
use crate::error::{ProviderError, ProviderErrorKind};

/// Run `op` until it succeeds, retrying only errors whose kind is in `kinds`.
///
/// Any other error is returned immediately. When the attempt budget runs out
/// the last retryable error is returned.
pub async fn retry_on<T, F, Fut, B>(
    kinds: &[ProviderErrorKind],
    backoff: &B,
    description: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    B: Backoff + ?Sized,
{
    let max_attempts = backoff.max_attempts();
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if kinds.contains(&err.kind()) && attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    operation = description,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient provider error"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
