//! Sliding-window request throttle
//!
//! Counts a user's recent entries for an action in the store's rate log and
//! rejects the request once the window is full. The count and the append
//! happen in one store call, so concurrent requests cannot overshoot. Entries are never pruned
//! here; retention is the store's concern.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::types::EscrowError;

use super::context::EscrowContext;

/// Action name used for payment-intent creation
pub const CREATE_PAYMENT_INTENT: &str = "create_payment_intent";

#[derive(Debug, Clone)]
pub struct RateLimiter {
    ctx: Arc<EscrowContext>,
}

impl RateLimiter {
    pub fn new(ctx: Arc<EscrowContext>) -> Self {
        Self { ctx }
    }

    /// Record one request, or fail if `limit` were already made within `window`
    ///
    /// # Returns
    ///
    /// * `Ok(())` - the request is allowed and has been recorded
    /// * `Err(EscrowError::ResourceExhausted)` - the window is full; nothing recorded
    pub async fn check_and_record(
        &self,
        user: &str,
        action: &str,
        limit: u32,
        window: Duration,
    ) -> Result<(), EscrowError> {
        let now = self.ctx.clock.now();
        let window_start = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let recent = self
            .ctx
            .store
            .record_rate_event_within(user, action, window_start, limit as usize, now)
            .await?;

        if recent >= limit as usize {
            warn!(user, action, recent, limit, "rate limit exceeded");
            return Err(EscrowError::resource_exhausted(
                user,
                action,
                limit,
                window.as_secs(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EscrowConfig;
    use crate::core::traits::ManualClock;
    use crate::gateway::MemoryProcessor;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn setup() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ctx = EscrowContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryProcessor::new()),
            EscrowConfig::default(),
        )
        .with_clock(clock.clone());
        (clock, RateLimiter::new(Arc::new(ctx)))
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let (_clock, limiter) = setup();
        let window = Duration::from_secs(3600);

        for _ in 0..3 {
            limiter.check_and_record("bob", "pay", 3, window).await.unwrap();
        }

        let result = limiter.check_and_record("bob", "pay", 3, window).await;
        assert_eq!(
            result,
            Err(EscrowError::resource_exhausted("bob", "pay", 3, 3600))
        );
    }

    #[tokio::test]
    async fn test_limits_are_per_user_and_action() {
        let (_clock, limiter) = setup();
        let window = Duration::from_secs(3600);

        limiter.check_and_record("bob", "pay", 1, window).await.unwrap();

        assert!(limiter.check_and_record("carol", "pay", 1, window).await.is_ok());
        assert!(limiter.check_and_record("bob", "other", 1, window).await.is_ok());
        assert!(limiter.check_and_record("bob", "pay", 1, window).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_respect_limit() {
        let (_clock, limiter) = setup();
        let window = Duration::from_secs(3600);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_and_record("bob", "pay", 5, window).await })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (clock, limiter) = setup();
        let window = Duration::from_secs(3600);

        limiter.check_and_record("bob", "pay", 1, window).await.unwrap();
        assert!(limiter.check_and_record("bob", "pay", 1, window).await.is_err());

        clock.advance(chrono::Duration::minutes(61)).unwrap();

        assert!(limiter.check_and_record("bob", "pay", 1, window).await.is_ok());
    }
}
