//! Bounded retry for transient I/O against the secret store, the database
//! and the orchestrator API. Fixed schedule: 3 retries at 1s/2s/4s, then
//! the last error escalates to the caller.

use std::future::Future;
use std::time::Duration;

use crate::errors::RotateError;

const MAX_RETRIES: u32 = 3;

/// Run `op`, retrying on transient errors with exponential backoff.
/// Non-transient errors (auth, conflict, corrupt input) escalate immediately.
pub async fn with_backoff<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, RotateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RotateError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt <= MAX_RETRIES => {
                let wait = backoff_delay(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    wait_secs = wait.as_secs(),
                    "transient failure, retrying: {}",
                    e
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential: 1s, 2s, 4s for attempts 1..=3.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt - 1).min(2))
}
