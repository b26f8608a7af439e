//! Request Admission Control
//!
//! Fixed-window request counting per caller identity with escalating
//! temporary blocks. Sustained abuse converts a cheap per-window check
//! into a longer-lived deny without re-incrementing counters.
//!
//! Caller identities are never logged in clear text; a truncated SHA-256
//! digest is used on every reporting surface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests per window
    pub max_requests: u32,
    /// Window length
    pub window: Duration,
    /// Block duration once the ceiling is crossed
    pub block_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,                         // 100 requests
            window: Duration::from_secs(15 * 60),      // per 15 minutes
            block_duration: Duration::from_secs(3600), // 1 hour block
        }
    }
}

/// Per-caller request window. Replaced wholesale on expiry.
#[derive(Debug, Clone)]
struct RequestWindow {
    count: u32,
    reset_at: Instant,
}

/// Admission decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        /// Requests left in the current window
        remaining: u32,
        /// Time until the window resets
        reset_in: Duration,
    },
    Denied {
        reason: String,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Rate limiter statistics (identities already hashed away)
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub active_windows: usize,
    pub blocked_callers: usize,
}

/// Fixed-window rate limiter with temporary blocks
pub struct RateLimiter {
    config: RateLimiterConfig,
    /// caller identity -> current window
    windows: RwLock<HashMap<String, RequestWindow>>,
    /// caller identity -> block expiry
    blocks: RwLock<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    /// Non-reversible identity digest for logs and statistics
    pub fn hash_identity(caller_id: &str) -> String {
        let digest = Sha256::digest(caller_id.as_bytes());
        hex::encode(&digest[..6])
    }

    /// Check whether a request from this caller is admitted.
    ///
    /// An active block is consulted before any window state; a blocked
    /// caller is denied even if a fresh window would have allowed it.
    pub async fn check(&self, caller_id: &str) -> RateDecision {
        let now = Instant::now();

        {
            let mut blocks = self.blocks.write().await;
            if let Some(&expires_at) = blocks.get(caller_id) {
                if now < expires_at {
                    debug!(
                        "Caller {} denied: block active",
                        Self::hash_identity(caller_id)
                    );
                    return RateDecision::Denied {
                        reason: "Temporarily blocked due to repeated rate limit violations"
                            .to_string(),
                        retry_after: expires_at - now,
                    };
                }
                // Expired block, lazily removed
                blocks.remove(caller_id);
            }
        }

        let mut windows = self.windows.write().await;
        let fresh = match windows.get(caller_id) {
            Some(window) => now >= window.reset_at,
            None => true,
        };

        if fresh {
            windows.insert(
                caller_id.to_string(),
                RequestWindow {
                    count: 1,
                    reset_at: now + self.config.window,
                },
            );
            return RateDecision::Allowed {
                remaining: self.config.max_requests.saturating_sub(1),
                reset_in: self.config.window,
            };
        }

        let window = windows
            .get_mut(caller_id)
            .expect("window present when not fresh");
        window.count += 1;

        if window.count > self.config.max_requests {
            let reset_in = window.reset_at.saturating_duration_since(now);
            windows.remove(caller_id);

            let mut blocks = self.blocks.write().await;
            blocks.insert(caller_id.to_string(), now + self.config.block_duration);
            warn!(
                "Caller {} exceeded {} requests, blocked for {}s (window had {}s left)",
                Self::hash_identity(caller_id),
                self.config.max_requests,
                self.config.block_duration.as_secs(),
                reset_in.as_secs(),
            );

            return RateDecision::Denied {
                reason: "Rate limit exceeded".to_string(),
                retry_after: self.config.block_duration,
            };
        }

        RateDecision::Allowed {
            remaining: self.config.max_requests - window.count,
            reset_in: window.reset_at.saturating_duration_since(now),
        }
    }

    /// Clear all state for a caller (admin action)
    pub async fn reset(&self, caller_id: &str) {
        self.windows.write().await.remove(caller_id);
        self.blocks.write().await.remove(caller_id);
    }

    /// Drop expired windows and blocks (call periodically)
    pub async fn cleanup(&self) {
        let now = Instant::now();

        let mut windows = self.windows.write().await;
        windows.retain(|_, w| now < w.reset_at);
        drop(windows);

        let mut blocks = self.blocks.write().await;
        blocks.retain(|_, &mut expires_at| now < expires_at);
    }

    /// Current counts, for reporting
    pub async fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let windows = self.windows.read().await;
        let blocks = self.blocks.read().await;

        RateLimiterStats {
            active_windows: windows.values().filter(|w| now < w.reset_at).count(),
            blocked_callers: blocks.values().filter(|&&e| now < e).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(max_requests: u32) -> RateLimiterConfig {
        RateLimiterConfig {
            max_requests,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_allows_up_to_ceiling() {
        let limiter = RateLimiter::new(small_config(5));

        for i in 0..5 {
            let decision = limiter.check("ip-A").await;
            assert!(decision.is_allowed(), "request {} should be allowed", i);
        }
    }

    #[tokio::test]
    async fn test_default_ceiling_hundred_and_first_is_denied() {
        let limiter = RateLimiter::with_defaults();

        for i in 0..100 {
            assert!(
                limiter.check("ip-A").await.is_allowed(),
                "request {} should be allowed",
                i + 1
            );
        }

        match limiter.check("ip-A").await {
            RateDecision::Denied { reason, .. } => assert_eq!(reason, "Rate limit exceeded"),
            other => panic!("expected denial on request 101, got {:?}", other),
        }

        // The caller stays denied until the block expires
        assert!(!limiter.check("ip-A").await.is_allowed());
    }

    #[tokio::test]
    async fn test_ceiling_plus_one_is_denied_and_blocked() {
        let limiter = RateLimiter::new(small_config(3));

        for _ in 0..3 {
            assert!(limiter.check("ip-A").await.is_allowed());
        }

        let denied = limiter.check("ip-A").await;
        match denied {
            RateDecision::Denied { reason, .. } => {
                assert_eq!(reason, "Rate limit exceeded");
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // Subsequent requests hit the block, not a fresh window
        let still_denied = limiter.check("ip-A").await;
        assert!(!still_denied.is_allowed());
    }

    #[tokio::test]
    async fn test_block_takes_precedence_over_fresh_window() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window: Duration::from_millis(10),
            block_duration: Duration::from_secs(60),
        });

        assert!(limiter.check("ip-A").await.is_allowed());
        assert!(!limiter.check("ip-A").await.is_allowed());

        // Wait past the window; a fresh window would allow, the block must not
        tokio::time::sleep(Duration::from_millis(20)).await;
        let decision = limiter.check("ip-A").await;
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_window_expiry_restores_quota() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 2,
            window: Duration::from_millis(20),
            block_duration: Duration::from_secs(60),
        });

        assert!(limiter.check("ip-A").await.is_allowed());
        assert!(limiter.check("ip-A").await.is_allowed());

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Fresh window, count restarts at 1
        match limiter.check("ip-A").await {
            RateDecision::Allowed { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("expected allow after window expiry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_caller_isolation() {
        let limiter = RateLimiter::new(small_config(1));

        assert!(limiter.check("ip-A").await.is_allowed());
        assert!(!limiter.check("ip-A").await.is_allowed());

        // Other callers keep their own quota
        assert!(limiter.check("ip-B").await.is_allowed());
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = RateLimiter::new(small_config(3));

        match limiter.check("ip-A").await {
            RateDecision::Allowed { remaining, .. } => assert_eq!(remaining, 2),
            _ => panic!("expected allow"),
        }
        match limiter.check("ip-A").await {
            RateDecision::Allowed { remaining, .. } => assert_eq!(remaining, 1),
            _ => panic!("expected allow"),
        }
    }

    #[tokio::test]
    async fn test_reset_clears_block() {
        let limiter = RateLimiter::new(small_config(1));

        assert!(limiter.check("ip-A").await.is_allowed());
        assert!(!limiter.check("ip-A").await.is_allowed());

        limiter.reset("ip-A").await;
        assert!(limiter.check("ip-A").await.is_allowed());
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_requests: 1,
            window: Duration::from_millis(10),
            block_duration: Duration::from_millis(10),
        });

        limiter.check("ip-A").await;
        limiter.check("ip-A").await; // blocks ip-A
        limiter.check("ip-B").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.cleanup().await;

        let stats = limiter.stats().await;
        assert_eq!(stats.active_windows, 0);
        assert_eq!(stats.blocked_callers, 0);
    }

    #[test]
    fn test_identity_hash_is_stable_and_opaque() {
        let a = RateLimiter::hash_identity("203.0.113.7");
        let b = RateLimiter::hash_identity("203.0.113.7");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert!(!a.contains("203"));
    }
}
