use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

/// Outcome of a rate-limit check, surfaced to the caller and echoed in the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the current window expires.
    pub reset_at_ms: i64,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self) -> u64 {
        let now = Utc::now().timestamp_millis();
        ((self.reset_at_ms - now).max(0) as u64).div_ceil(1000)
    }
}

/// Injected store abstraction: the pipeline only sees this trait, so the
/// in-process map can be swapped for a shared store in multi-instance
/// deployments.
pub trait RateLimitStore: Send + Sync {
    fn check(&self, identity: &str) -> RateLimitDecision;
    fn sweep(&self);
    fn len(&self) -> usize;
}

#[derive(Debug)]
struct WindowEntry {
    count: u32,
    reset_at_ms: i64,
}

/// Fixed-window counter keyed by client identity. O(1) per check; no
/// sliding window or token bucket. Expired entries are swept opportunistically
/// once the store grows past `sweep_threshold`.
pub struct FixedWindowLimiter {
    window_ms: i64,
    capacity: u32,
    sweep_threshold: usize,
    entries: DashMap<String, WindowEntry>,
}

impl FixedWindowLimiter {
    pub fn new(window: std::time::Duration, capacity: u32, sweep_threshold: usize) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            capacity,
            sweep_threshold,
            entries: DashMap::new(),
        }
    }

    fn check_at(&self, identity: &str, now_ms: i64) -> RateLimitDecision {
        if self.entries.len() > self.sweep_threshold {
            self.sweep_at(now_ms);
        }

        // The entry guard holds the shard lock for the whole read-modify-write,
        // so concurrent bursts from the same identity cannot undercount.
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                reset_at_ms: now_ms + self.window_ms,
            });

        if now_ms >= entry.reset_at_ms {
            entry.count = 0;
            entry.reset_at_ms = now_ms + self.window_ms;
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: entry.count <= self.capacity,
            limit: self.capacity,
            remaining: self.capacity.saturating_sub(entry.count),
            reset_at_ms: entry.reset_at_ms,
        }
    }

    fn sweep_at(&self, now_ms: i64) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_at_ms > now_ms);
        debug!(
            swept = before - self.entries.len(),
            remaining = self.entries.len(),
            "Swept expired rate-limit entries"
        );
    }
}

impl RateLimitStore for FixedWindowLimiter {
    fn check(&self, identity: &str) -> RateLimitDecision {
        self.check_at(identity, Utc::now().timestamp_millis())
    }

    fn sweep(&self) {
        self.sweep_at(Utc::now().timestamp_millis());
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(capacity: u32) -> FixedWindowLimiter {
        FixedWindowLimiter::new(Duration::from_secs(60), capacity, 10_000)
    }

    #[test]
    fn first_request_starts_a_window() {
        let limiter = limiter(5);
        let decision = limiter.check_at("1.2.3.4", 1_000);
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_at_ms, 61_000);
    }

    #[test]
    fn capacity_plus_one_is_rejected() {
        let limiter = limiter(3);
        for expected_remaining in [2u32, 1, 0] {
            let decision = limiter.check_at("client", 1_000);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let decision = limiter.check_at("client", 1_000);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        // once over capacity, every further request in the window is rejected
        let decision = limiter.check_at("client", 30_000);
        assert!(!decision.allowed);
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let limiter = limiter(2);
        limiter.check_at("client", 1_000);
        limiter.check_at("client", 1_000);
        assert!(!limiter.check_at("client", 1_500).allowed);

        // past reset_at (1_000 + 60_000) a fresh window begins
        let decision = limiter.check_at("client", 61_000);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at_ms, 121_000);
    }

    #[test]
    fn identities_are_independent() {
        let limiter = limiter(1);
        assert!(limiter.check_at("a", 1_000).allowed);
        assert!(!limiter.check_at("a", 1_000).allowed);
        assert!(limiter.check_at("b", 1_000).allowed);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60), 10, 10_000);
        limiter.check_at("old", 1_000);
        limiter.check_at("fresh", 50_000);
        assert_eq!(limiter.len(), 2);

        limiter.sweep_at(65_000); // "old" expired at 61_000
        assert_eq!(limiter.len(), 1);
        assert!(limiter.entries.contains_key("fresh"));
    }

    #[test]
    fn oversized_store_triggers_inline_sweep() {
        let limiter = FixedWindowLimiter::new(Duration::from_secs(60), 10, 3);
        for i in 0..4 {
            limiter.check_at(&format!("client-{}", i), 1_000);
        }
        assert_eq!(limiter.len(), 4);

        // next check past expiry sweeps the expired keys before inserting
        limiter.check_at("late", 70_000);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn concurrent_bursts_never_undercount() {
        use std::sync::Arc;

        let limiter = Arc::new(limiter(50));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                let mut allowed = 0u32;
                for _ in 0..25 {
                    if limiter.check("burst").allowed {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
    }
}
