//! C2 (part 2): `LockManager.WithLock` (§4.2) — acquires `lock:{ownerKey}:{purpose}`,
//! executes `body`, releases in a finalising step regardless of outcome. No re-entrancy:
//! nested `with_lock` on the same (owner, purpose) is a caller contract, not runtime-enforced.

use crate::error::CoreError;
use crate::store::kv::LockBackend;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub struct LockManager<B: LockBackend> {
    backend: Arc<B>,
    max_attempts: u32,
}

impl<B: LockBackend> LockManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn with_max_attempts(backend: Arc<B>, max_attempts: u32) -> Self {
        Self { backend, max_attempts: max_attempts.max(1) }
    }

    /// Acquires `lock:{owner_key}:{purpose}`, runs `body`, and always releases — even if
    /// `body` returns an error, per §7 ("the lock is always released in a finalising step").
    #[tracing::instrument(skip(self, body), fields(owner_key, purpose, lease_ms))]
    pub async fn with_lock<T, F, Fut>(
        &self,
        owner_key: &str,
        purpose: &str,
        lease_ms: i64,
        body: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let lock_key = format!("lock:{owner_key}:{purpose}");
        let token = Uuid::new_v4().to_string();

        let mut attempt = 0u32;
        loop {
            let now_ms = now_millis();
            if self.backend.try_acquire(&lock_key, &token, lease_ms, now_ms) {
                break;
            }
            attempt += 1;
            if attempt >= self.max_attempts {
                return Err(CoreError::LockTimeout { owner_key: owner_key.to_string(), purpose: purpose.to_string() });
            }
            let delay = backoff_delay_ms(attempt);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let result = body().await;
        self.backend.release(&lock_key, &token);
        result
    }
}

fn backoff_delay_ms(attempt: u32) -> u64 {
    let raw = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(20)).min(MAX_BACKOFF_MS);
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.10);
    let jitter = (raw as f64 * jitter_frac) as u64;
    raw.saturating_sub(jitter)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
