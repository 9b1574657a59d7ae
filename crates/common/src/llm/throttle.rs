//! Process-wide throttle around a completion client
//!
//! Three limits apply to every call regardless of which job issued it:
//! - a concurrency cap (`tokio::sync::Semaphore`)
//! - a request rate (governor token bucket)
//! - a shared cooldown armed by any rate-limit response carrying `Retry-After`

use super::{Completion, CompletionClient, CompletionError, CompletionRequest};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;

/// Rate limiter shared by all callers
pub type CompletionRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Completion client wrapper enforcing global limits
#[derive(Clone)]
pub struct ThrottledClient {
    inner: Arc<dyn CompletionClient>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    limiter: Arc<CompletionRateLimiter>,
    cooldown_until: Arc<RwLock<Option<Instant>>>,
}

impl ThrottledClient {
    pub fn new(
        inner: Arc<dyn CompletionClient>,
        max_concurrency: usize,
        requests_per_minute: u32,
    ) -> Result<Self> {
        let per_minute = NonZeroU32::new(requests_per_minute).ok_or_else(|| {
            AppError::Configuration {
                message: "completion.requests_per_minute must be positive".to_string(),
            }
        })?;
        if max_concurrency == 0 {
            return Err(AppError::Configuration {
                message: "completion.max_concurrency must be positive".to_string(),
            });
        }

        let quota = Quota::per_minute(per_minute);

        Ok(Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            limiter: Arc::new(RateLimiter::direct(quota)),
            cooldown_until: Arc::new(RwLock::new(None)),
        })
    }

    /// Calls currently holding a concurrency permit
    pub fn in_flight(&self) -> usize {
        self.max_concurrency.saturating_sub(self.permits.available_permits())
    }

    /// Remaining shared cooldown, if any
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        let until = (*self.cooldown_until.read().await)?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    async fn wait_for_cooldown(&self) {
        while let Some(remaining) = self.cooldown_remaining().await {
            tracing::debug!(wait_ms = remaining.as_millis() as u64, "Waiting out completion cooldown");
            tokio::time::sleep(remaining).await;
        }
    }

    async fn arm_cooldown(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut guard = self.cooldown_until.write().await;
        if (*guard).map_or(true, |current| current < until) {
            *guard = Some(until);
            tracing::warn!(
                cooldown_ms = delay.as_millis() as u64,
                "Completion service asked to back off; pausing all callers"
            );
        }
    }
}

#[async_trait]
impl CompletionClient for ThrottledClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, CompletionError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CompletionError::transient("completion throttle closed"))?;

        self.wait_for_cooldown().await;
        self.limiter.until_ready().await;

        let result = self.inner.complete(request).await;
        if let Err(CompletionError::Transient {
            retry_after: Some(delay),
            ..
        }) = &result
        {
            self.arm_cooldown(*delay).await;
        }
        result
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps briefly and tracks the peak number of concurrent calls
    struct SlowClient {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CompletionClient for SlowClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> std::result::Result<Completion, CompletionError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Completion {
                text: "ok".to_string(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: None,
                model: request.model.clone(),
            })
        }

        fn provider(&self) -> &str {
            "slow"
        }
    }

    struct RateLimitedClient;

    #[async_trait]
    impl CompletionClient for RateLimitedClient {
        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> std::result::Result<Completion, CompletionError> {
            Err(CompletionError::Transient {
                message: "429".to_string(),
                retry_after: Some(Duration::from_secs(30)),
            })
        }

        fn provider(&self) -> &str {
            "limited"
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: String::new(),
            user: "hello".to_string(),
            model: "m".to_string(),
            temperature: 0.0,
            max_output_tokens: 16,
            top_p: None,
            top_k: None,
            seed: None,
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_holds() {
        let inner = Arc::new(SlowClient {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let throttled = ThrottledClient::new(inner.clone(), 2, 60_000).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = throttled.clone();
            handles.push(tokio::spawn(async move { client.complete(&request()).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert!(inner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(throttled.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_arms_shared_cooldown() {
        let throttled = ThrottledClient::new(Arc::new(RateLimitedClient), 4, 600).unwrap();
        assert!(throttled.cooldown_remaining().await.is_none());

        let err = throttled.complete(&request()).await.unwrap_err();
        assert!(err.is_transient());

        let remaining = throttled.cooldown_remaining().await.unwrap();
        assert!(remaining > Duration::from_secs(25));

        // Clones share the same cooldown
        let other = throttled.clone();
        assert!(other.cooldown_remaining().await.is_some());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        assert!(ThrottledClient::new(Arc::new(RateLimitedClient), 0, 10).is_err());
        assert!(ThrottledClient::new(Arc::new(RateLimitedClient), 1, 0).is_err());
    }
}
