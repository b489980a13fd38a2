//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Rate-limit window counters (see [`crate::ratelimiter::RedisWindowStore`])
//! - Single-instance locks for the retention sweepers

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::sweeper::SweepLock;

/// Redis key constants
pub mod keys {
    /// Rate-limit window hash prefix, followed by the code id
    pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";

    /// Lock held by the instance sweeping code logs
    pub const CODELOG_CLEANER_LOCK: &str = "codelogcleaner";

    /// Lock held by the instance sweeping code runs
    pub const CODERUN_CLEANER_LOCK: &str = "coderuncleaner";
}

const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Shared Redis handle. Cloning is cheap; clones share one multiplexed
/// connection.
#[derive(Clone)]
pub struct RedisManager {
    conn: MultiplexedConnection,
}

impl RedisManager {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }

    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .context("Failed to ping Redis")?;
        Ok(())
    }

    /// Claim `key` for `ttl` using SET NX EX. Returns false if already held.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("claimed")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1) as usize)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to claim lock {}", key))?;
        Ok(claimed.is_some())
    }
}

#[async_trait]
impl SweepLock for RedisManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> crate::error::Result<bool> {
        self.try_lock(key, ttl)
            .await
            .map_err(|e| crate::error::Error::Other(format!("{:#}", e)))
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < MAX_CONNECT_ATTEMPTS => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Giving up on Redis after {} attempts",
                    MAX_CONNECT_ATTEMPTS
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys() {
        assert_eq!(keys::CODELOG_CLEANER_LOCK, "codelogcleaner");
        assert_eq!(keys::CODERUN_CLEANER_LOCK, "coderuncleaner");
        assert_eq!(format!("{}{}", keys::RATE_LIMIT_PREFIX, "abc"), "ratelimit:abc");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        assert!(RedisManager::connect("not a url").await.is_err());
    }
}
