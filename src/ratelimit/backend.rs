//! Store trait for abstracting the shared state behind the limiter.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors a store can report. All of them are infrastructure faults; an
/// absent key is never an error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation failed: {0}")]
    Operation(String),
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("unexpected store reply: {0}")]
    Protocol(i64),
}

/// Trait for shared TAT stores.
///
/// Implementations must run the whole read/compute/write sequence of
/// [`evaluate`](TatStore::evaluate) as one atomic unit per key. A client-side
/// read followed by a separate write is not an acceptable implementation.
#[async_trait]
pub trait TatStore: Send + Sync {
    /// Run one GCRA evaluation for `key`.
    ///
    /// Returns `0` when admitted (TAT advanced) or `-wait_ms` when rejected
    /// (TAT untouched).
    async fn evaluate(
        &self,
        key: &str,
        burst: u32,
        period_ns: u64,
        now_ns: u64,
    ) -> Result<i64, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
