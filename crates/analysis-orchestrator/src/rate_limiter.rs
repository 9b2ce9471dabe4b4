use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Per-provider sliding-window limit: at most `max_requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window }
    }
}

/// Non-blocking admission control keyed by provider name.
///
/// Each provider's window lives in its own map entry, so the prune/check/push
/// sequence runs under that entry's lock and concurrent callers never over-admit.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    default_limit: RateLimit,
    overrides: HashMap<String, RateLimit>,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            windows: DashMap::new(),
            default_limit,
            overrides: HashMap::new(),
        }
    }

    /// Custom limit for a single provider.
    pub fn with_limit(mut self, provider: impl Into<String>, limit: RateLimit) -> Self {
        self.overrides.insert(provider.into(), limit);
        self
    }

    pub fn limit_for(&self, provider: &str) -> RateLimit {
        self.overrides
            .get(provider)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Record and admit one request if the provider still has room in its window.
    pub fn allow(&self, provider: &str) -> bool {
        self.allow_at(provider, Instant::now())
    }

    fn allow_at(&self, provider: &str, now: Instant) -> bool {
        let limit = self.limit_for(provider);
        let mut timestamps = self.windows.entry(provider.to_string()).or_default();

        // Remove timestamps outside the window
        while let Some(&front) = timestamps.front() {
            if now.saturating_duration_since(front) >= limit.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() < limit.max_requests {
            timestamps.push_back(now);
            true
        } else {
            tracing::debug!(
                "Rate limiter: {} refused ({} requests in the last {:.1}s)",
                provider,
                timestamps.len(),
                limit.window.as_secs_f64()
            );
            false
        }
    }

    /// Requests currently counted against the provider's window.
    pub fn in_window(&self, provider: &str) -> usize {
        let limit = self.limit_for(provider);
        let now = Instant::now();
        self.windows
            .get(provider)
            .map(|ts| {
                ts.iter()
                    .filter(|&&t| now.saturating_duration_since(t) < limit.window)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(RateLimit::new(2, Duration::from_secs(10)));
        let start = Instant::now();

        assert!(limiter.allow_at("esg", start));
        assert!(limiter.allow_at("esg", start + Duration::from_secs(1)));
        assert!(!limiter.allow_at("esg", start + Duration::from_secs(2)));

        // First request falls out of the window
        assert!(limiter.allow_at("esg", start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("esg", start + Duration::from_secs(10)));
    }

    #[test]
    fn test_providers_are_independent() {
        let limiter = RateLimiter::new(RateLimit::new(1, Duration::from_secs(60)))
            .with_limit("sentiment", RateLimit::new(3, Duration::from_secs(60)));

        assert!(limiter.allow("macroeconomic"));
        assert!(!limiter.allow("macroeconomic"));

        assert!(limiter.allow("sentiment"));
        assert!(limiter.allow("sentiment"));
        assert!(limiter.allow("sentiment"));
        assert!(!limiter.allow("sentiment"));
        assert_eq!(limiter.in_window("sentiment"), 3);
        assert_eq!(limiter.in_window("esg"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_over_admit() {
        let limiter = Arc::new(RateLimiter::new(RateLimit::new(10, Duration::from_secs(60))));
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                if limiter.allow("short_interest") {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 10);
        assert_eq!(limiter.in_window("short_interest"), 10);
    }
}
