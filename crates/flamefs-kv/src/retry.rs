//! Transaction retry loop with exponential backoff.
//!
//! Callers wrap read-write transactions in [`with_rw_txn_retry`]. `Conflict`,
//! `Throttled` and `TooOld` retry unconditionally; `MaybeCommitted` retries
//! only when the caller asserts idempotency (a request uuid carried in-band
//! makes the replay a no-op).

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use flamefs_types::{Result, Status};

use crate::engine::KvEngine;
use crate::transaction::{ReadOnlyTransaction, ReadWriteTransaction};

/// Backoff bounds for a retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub init_wait: Duration,
    pub max_wait: Duration,
    /// Total budget across all attempts.
    pub max_total: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            init_wait: Duration::from_millis(10),
            max_wait: Duration::from_secs(1),
            max_total: Duration::from_secs(30),
        }
    }
}

/// Boxed future tied to the transaction borrow of one attempt.
pub type TxnFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

/// Run `body` inside a read-write transaction, committing on success and
/// retrying per the policy above. Each attempt gets a fresh transaction.
pub async fn with_rw_txn_retry<E, T>(
    engine: &E,
    config: &RetryConfig,
    idempotent: bool,
    mut body: impl for<'t> FnMut(&'t mut E::RwTxn) -> TxnFuture<'t, T> + Send,
) -> Result<T>
where
    E: KvEngine,
    T: Send,
{
    let start = Instant::now();
    let mut wait = config.init_wait;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let mut txn = engine.create_readwrite_transaction();
        let result = match body(&mut txn).await {
            Ok(value) => txn.commit().await.map(|_| value),
            Err(status) => {
                let _ = txn.cancel().await;
                Err(status)
            }
        };

        let status = match result {
            Ok(value) => return Ok(value),
            Err(status) => status,
        };

        let retryable =
            status.is_txn_retryable() || (status.is_maybe_committed() && idempotent);
        if !retryable || start.elapsed() >= config.max_total {
            return Err(status);
        }

        tracing::debug!(
            attempt,
            code = status.code(),
            wait_ms = wait.as_millis() as u64,
            "transaction retry"
        );
        tokio::time::sleep(retry_wait(wait, start, config)).await;
        wait = (wait * 2).min(config.max_wait);
    }
}

fn retry_wait(wait: Duration, start: Instant, config: &RetryConfig) -> Duration {
    let remaining = config.max_total.saturating_sub(start.elapsed());
    wait.min(remaining)
}

/// Whether a status should abort the whole retry loop immediately.
pub fn is_fatal(status: &Status) -> bool {
    use flamefs_types::StatusCode;
    matches!(
        status.code(),
        StatusCode::FOUND_BUG | StatusCode::DATA_CORRUPTION | StatusCode::INVALID_CONFIG
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bounds() {
        let config = RetryConfig::default();
        assert!(config.init_wait < config.max_wait);
        assert!(config.max_wait < config.max_total);
    }

    #[test]
    fn test_is_fatal() {
        use flamefs_types::{StatusCode, TransactionCode};
        assert!(is_fatal(&Status::new(StatusCode::FOUND_BUG)));
        assert!(!is_fatal(&Status::new(TransactionCode::CONFLICT)));
    }
}
