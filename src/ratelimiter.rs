//! Fixed-window admission control per code id.
//!
//! Each key owns a window record `{count, timestamp}`. Every call bumps the
//! counter and refreshes the key TTL in one atomic round trip, then:
//!
//! - if the window started more than `window` seconds ago (or never), the
//!   record is reset to `{timestamp: now, count: 1}` and the call is allowed;
//! - otherwise the call is allowed iff `count <= max_requests`.
//!
//! The reset overwrites the increment that triggered it, so the first call
//! of a window is counted once, not twice. Store failures allow the call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::config::RateLimiterConfig;
use crate::error::Result;
use crate::redis_manager::keys;

/// Window record as read back after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowState {
    pub count: i64,
    /// Unix seconds when the window opened; `None` when never set
    pub timestamp: Option<i64>,
}

#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Increment the counter, refresh the TTL and read the window start,
    /// as one atomic operation.
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowState>;
    /// Start a new window at `now` with a count of one.
    async fn reset(&self, key: &str, now: i64) -> Result<()>;
}

pub struct RedisWindowStore {
    conn: MultiplexedConnection,
}

impl RedisWindowStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn hit(&self, key: &str, window: Duration) -> Result<WindowState> {
        let mut conn = self.conn.clone();
        let (count, timestamp): (i64, Option<i64>) = redis::pipe()
            .atomic()
            .hincr(key, "count", 1)
            .expire(key, window.as_secs() as i64)
            .ignore()
            .hget(key, "timestamp")
            .query_async(&mut conn)
            .await?;
        Ok(WindowState { count, timestamp })
    }

    async fn reset(&self, key: &str, now: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg("timestamp")
            .arg(now)
            .arg("count")
            .arg(1)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Process-local window store. Expiry is not tracked; stale windows are
/// reset by the timestamp check like any other.
#[derive(Default)]
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, WindowState>>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn hit(&self, key: &str, _window: Duration) -> Result<WindowState> {
        let mut windows = self.windows.lock().await;
        let state = windows.entry(key.to_string()).or_default();
        state.count += 1;
        Ok(*state)
    }

    async fn reset(&self, key: &str, now: i64) -> Result<()> {
        self.windows.lock().await.insert(
            key.to_string(),
            WindowState {
                count: 1,
                timestamp: Some(now),
            },
        );
        Ok(())
    }
}

pub struct RateLimiter {
    store: Box<dyn WindowStore>,
    max_requests: i64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Box<dyn WindowStore>, config: &RateLimiterConfig) -> Self {
        Self {
            store,
            max_requests: config.max_requests,
            window: config.window,
        }
    }

    pub async fn allow(&self, code_id: &str) -> bool {
        self.allow_at(code_id, chrono::Utc::now().timestamp()).await
    }

    /// [`allow`](Self::allow) with an explicit clock, in unix seconds.
    pub async fn allow_at(&self, code_id: &str, now: i64) -> bool {
        let key = format!("{}{}", keys::RATE_LIMIT_PREFIX, code_id);

        let state = match self.store.hit(&key, self.window).await {
            Ok(state) => state,
            Err(e) => {
                error!(key = %key, error = %e, "rate limit transaction failed");
                WindowState::default()
            }
        };

        let window_secs = self.window.as_secs() as i64;
        if now - window_secs > state.timestamp.unwrap_or(0) {
            if let Err(e) = self.store.reset(&key, now).await {
                warn!(key = %key, error = %e, "failed to reset rate limit window");
            }
            return true;
        }

        state.count <= self.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn limiter(max_requests: i64, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            Box::new(MemoryWindowStore::new()),
            &RateLimiterConfig {
                max_requests,
                window: Duration::from_secs(window_secs),
            },
        )
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let limiter = limiter(3, 60);
        let now = 1_700_000_000;

        // first call opens the window with count 1
        assert!(limiter.allow_at("code-1", now).await);
        assert!(limiter.allow_at("code-1", now + 1).await); // 2
        assert!(limiter.allow_at("code-1", now + 2).await); // 3
        assert!(!limiter.allow_at("code-1", now + 3).await); // 4
        assert!(!limiter.allow_at("code-1", now + 4).await);
    }

    #[tokio::test]
    async fn test_window_expiry_resets() {
        let limiter = limiter(1, 60);
        let now = 1_700_000_000;

        assert!(limiter.allow_at("code-1", now).await);
        assert!(!limiter.allow_at("code-1", now + 10).await);

        // still inside the window at exactly +60
        assert!(!limiter.allow_at("code-1", now + 60).await);
        // expired
        assert!(limiter.allow_at("code-1", now + 61).await);
        assert!(!limiter.allow_at("code-1", now + 62).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        let now = 1_700_000_000;
        assert!(limiter.allow_at("a", now).await);
        assert!(!limiter.allow_at("a", now).await);
        assert!(limiter.allow_at("b", now).await);
    }

    #[tokio::test]
    async fn test_reset_discards_triggering_increment() {
        let store = MemoryWindowStore::new();
        let limiter = RateLimiter {
            store: Box::new(store),
            max_requests: 10,
            window: Duration::from_secs(60),
        };
        let now = 1_700_000_000;
        limiter.allow_at("code-1", now).await;

        let state = limiter
            .store
            .hit("ratelimit:code-1", Duration::from_secs(60))
            .await
            .unwrap();
        // reset wrote count 1, this hit made it 2
        assert_eq!(state.count, 2);
        assert_eq!(state.timestamp, Some(now));
    }

    struct BrokenStore;

    #[async_trait]
    impl WindowStore for BrokenStore {
        async fn hit(&self, _key: &str, _window: Duration) -> Result<WindowState> {
            Err(Error::Other("connection refused".into()))
        }

        async fn reset(&self, _key: &str, _now: i64) -> Result<()> {
            Err(Error::Other("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_allows() {
        let limiter = RateLimiter::new(Box::new(BrokenStore), &RateLimiterConfig::default());
        for _ in 0..1000 {
            assert!(limiter.allow("code-1").await);
        }
    }
}
