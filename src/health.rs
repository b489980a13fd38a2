//! Backend health checks for `/health`.
//!
//! Each configured backend is pinged concurrently with its own deadline.
//! A report is cached for [`CACHE_TTL`] so load balancers polling the
//! endpoint do not hammer the databases.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::redis_manager::RedisManager;

pub const CACHE_TTL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ServiceCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn ping(&self) -> Result<()>;
}

pub struct MongoCheck(pub mongodb::Database);

#[async_trait]
impl ServiceCheck for MongoCheck {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn ping(&self) -> Result<()> {
        self.0
            .run_command(mongodb::bson::doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }
}

pub struct PostgresCheck(pub sqlx::PgPool);

#[async_trait]
impl ServiceCheck for PostgresCheck {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.0)
            .await
            .context("PostgreSQL ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl ServiceCheck for RedisManager {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        RedisManager::ping(self).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub services: BTreeMap<&'static str, ServiceHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.services.values().all(|s| s.healthy)
    }
}

pub struct HealthChecker {
    services: Vec<Arc<dyn ServiceCheck>>,
    started: Instant,
    ttl: Duration,
    cache: Mutex<Option<(Instant, HealthReport)>>,
}

impl HealthChecker {
    pub fn new(services: Vec<Arc<dyn ServiceCheck>>) -> Self {
        Self::with_ttl(services, CACHE_TTL)
    }

    pub fn with_ttl(services: Vec<Arc<dyn ServiceCheck>>, ttl: Duration) -> Self {
        Self {
            services,
            started: Instant::now(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Latest report, refreshed when the cached one is older than the ttl.
    pub async fn check(&self) -> HealthReport {
        let mut cache = self.cache.lock().await;
        if let Some((at, report)) = cache.as_ref() {
            if at.elapsed() < self.ttl {
                return report.clone();
            }
        }

        let results = join_all(self.services.iter().map(|service| async move {
            let start = Instant::now();
            let outcome = match tokio::time::timeout(PING_TIMEOUT, service.ping()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("no answer within {}s", PING_TIMEOUT.as_secs())),
            };
            let latency_ms = start.elapsed().as_millis() as u64;
            let health = match outcome {
                Ok(()) => ServiceHealth {
                    healthy: true,
                    message: format!("{} is connected", service.name()),
                    latency_ms,
                },
                Err(e) => {
                    warn!(service = service.name(), "health check failed: {:#}", e);
                    ServiceHealth {
                        healthy: false,
                        message: format!("{:#}", e),
                        latency_ms,
                    }
                }
            };
            (service.name(), health)
        }))
        .await;

        let services: BTreeMap<_, _> = results.into_iter().collect();
        let healthy = services.values().all(|s| s.healthy);
        let report = HealthReport {
            status: if healthy { "healthy" } else { "unhealthy" },
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs(),
            services,
        };
        *cache = Some((Instant::now(), report.clone()));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticCheck {
        name: &'static str,
        healthy: bool,
        pings: AtomicUsize,
    }

    impl StaticCheck {
        fn new(name: &'static str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                healthy,
                pings: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ServiceCheck for StaticCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(())
            } else {
                anyhow::bail!("connection refused")
            }
        }
    }

    #[tokio::test]
    async fn test_no_services_is_healthy() {
        let report = HealthChecker::new(Vec::new()).check().await;
        assert!(report.is_healthy());
        assert_eq!(report.status, "healthy");
        assert!(report.services.is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_backend_marks_report_unhealthy() {
        let checker = HealthChecker::new(vec![
            StaticCheck::new("mongodb", true) as Arc<dyn ServiceCheck>,
            StaticCheck::new("redis", false) as Arc<dyn ServiceCheck>,
        ]);

        let report = checker.check().await;
        assert_eq!(report.status, "unhealthy");
        assert!(report.services["mongodb"].healthy);
        assert!(!report.services["redis"].healthy);
        assert!(report.services["redis"].message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_report_is_cached_until_ttl() {
        let service = StaticCheck::new("postgres", true);
        let checker = HealthChecker::new(vec![service.clone() as Arc<dyn ServiceCheck>]);
        checker.check().await;
        checker.check().await;
        assert_eq!(service.pings.load(Ordering::SeqCst), 1);

        let service = StaticCheck::new("postgres", true);
        let checker = HealthChecker::with_ttl(vec![service.clone() as Arc<dyn ServiceCheck>], Duration::ZERO);
        checker.check().await;
        checker.check().await;
        assert_eq!(service.pings.load(Ordering::SeqCst), 2);
    }
}
