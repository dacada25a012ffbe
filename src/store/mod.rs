pub mod memory;
pub mod redis;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::redis::RedisCounterStore;

/// KV key holding the active generation label.
pub const CURRENT_GENERATION_KEY: &str = "current_generation";

/// Failure of a single KV command.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error(transparent)]
    Command(#[from] ::redis::RedisError),
    #[error("unexpected value {value:?} under {key}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Failed(String),
}

/// Operational contract of the shared counter store.
///
/// All mutations are atomic at the command level; the scan is cursor-based
/// and non-transactional, so callers must tolerate keys appearing mid-scan.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomic float increment; the key is created at zero on first touch.
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<(), StoreError>;

    /// One page of keys matching `pattern`. Iteration starts at cursor 0 and
    /// ends when the returned cursor wraps back to 0. `count` is a hint.
    async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(Vec<String>, u64), StoreError>;

    /// Value under `key`, or None if missing.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Bulk delete. Partial failure surfaces as command failure.
    async fn del(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Runs `op` up to `attempts` times, returning the first success or the last
/// error. Retries are immediate.
pub async fn retry<T, E, F, Fut>(attempts: usize, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    debug_assert!(attempts > 0);
    let mut last = None;
    for _ in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => last = Some(e),
        }
    }
    Err(last.expect("attempts must be > 0"))
}
