//! Retention sweeper for runs and logs.
//!
//! Every tick the sweeper checks whether local time falls inside the one
//! hour window that opens at the configured daily schedule time. Inside the
//! window it deletes one bounded batch of records older than the retention
//! period. Large backlogs therefore drain over several ticks and days.
//!
//! Only one instance per target should sweep, so the loop is started only
//! after a [`SweepLock`] has been claimed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::CleanerConfig;
use crate::error::Result;

/// How long a claimed sweeper lock is held.
pub const LOCK_TTL: Duration = Duration::from_secs(3600);

/// Something whose old records can be deleted in bounded batches.
#[async_trait]
pub trait Purge: Send + Sync {
    fn name(&self) -> &'static str;
    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;
}

/// Cross-instance lock guarding a sweeper.
#[async_trait]
pub trait SweepLock: Send + Sync {
    /// `Ok(false)` when another instance holds `key`.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Always granted; for single-instance deployments without Redis.
pub struct LocalLock;

#[async_trait]
impl SweepLock for LocalLock {
    async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        Ok(true)
    }
}

/// True when `now` is in `[schedule, schedule + 1h)` of the same day.
pub fn in_schedule_window(now: NaiveDateTime, schedule: NaiveTime) -> bool {
    let start = now.date().and_time(schedule);
    now >= start && now < start + chrono::Duration::hours(1)
}

pub struct RetentionSweeper<P: Purge + ?Sized> {
    target: Arc<P>,
    config: CleanerConfig,
    lock_key: &'static str,
    shutdown: Arc<Notify>,
}

impl<P: Purge + ?Sized + 'static> RetentionSweeper<P> {
    pub fn new(target: Arc<P>, config: CleanerConfig, lock_key: &'static str) -> Self {
        Self {
            target,
            config,
            lock_key,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Delete one batch if `now` is inside the window. Returns the number
    /// deleted, or `None` when outside the window.
    pub async fn sweep_at(&self, now: DateTime<Local>) -> Result<Option<u64>> {
        if !in_schedule_window(now.naive_local(), self.config.schedule_time) {
            return Ok(None);
        }
        let cutoff = now.with_timezone(&Utc) - chrono::Duration::days(self.config.retention_days);
        let deleted = self
            .target
            .delete_older(cutoff, self.config.batch_limit)
            .await?;
        Ok(Some(deleted))
    }

    /// Run the tick loop until the shutdown handle is notified.
    pub async fn run(&self) {
        info!(
            target_name = self.target.name(),
            tick_secs = self.config.tick.as_secs(),
            retention_days = self.config.retention_days,
            schedule = %self.config.schedule_time,
            "Retention sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.tick);
        // the first tick of an interval completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(target_name = self.target.name(), "Retention sweeper received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    match self.sweep_at(Local::now()).await {
                        Ok(Some(deleted)) => {
                            info!(target_name = self.target.name(), deleted, "deleted old records");
                        }
                        Ok(None) => debug!(target_name = self.target.name(), "outside sweep window"),
                        Err(e) => {
                            error!(target_name = self.target.name(), error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        }
    }

    /// Claim the lock and spawn the loop. Returns `None` if disabled or if
    /// another instance already holds the lock.
    pub async fn start(self, lock: &dyn SweepLock) -> Option<(JoinHandle<()>, Arc<Notify>)> {
        if !self.config.enabled {
            info!(target_name = self.target.name(), "Retention sweeper disabled");
            return None;
        }

        match lock.try_acquire(self.lock_key, LOCK_TTL).await {
            Ok(true) => {}
            Ok(false) => {
                info!(key = self.lock_key, "already has lock for sweeper, not starting");
                return None;
            }
            Err(e) => {
                error!(key = self.lock_key, error = %e, "failed to claim sweeper lock");
                return None;
            }
        }

        let shutdown = self.shutdown_handle();
        let handle = tokio::spawn(async move { self.run().await });
        Some((handle, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Timelike};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingPurge {
        calls: Mutex<Vec<(DateTime<Utc>, i64)>>,
        fail: bool,
    }

    #[async_trait]
    impl Purge for RecordingPurge {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
            self.calls.lock().await.push((cutoff, limit));
            if self.fail {
                return Err(crate::error::Error::Other("store down".into()));
            }
            Ok(7)
        }
    }

    struct HeldLock;

    #[async_trait]
    impl SweepLock for HeldLock {
        async fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn local(h: u32, m: u32) -> DateTime<Local> {
        Local.from_local_datetime(&at(h, m)).earliest().unwrap()
    }

    fn one_am() -> NaiveTime {
        NaiveTime::from_hms_opt(1, 0, 0).unwrap()
    }

    #[test]
    fn test_in_schedule_window() {
        assert!(in_schedule_window(at(1, 0), one_am()));
        assert!(in_schedule_window(at(1, 30), one_am()));
        assert!(in_schedule_window(at(1, 59), one_am()));
        assert!(!in_schedule_window(at(2, 0), one_am()));
        assert!(!in_schedule_window(at(0, 59), one_am()));
        assert!(!in_schedule_window(at(13, 0), one_am()));
    }

    #[tokio::test]
    async fn test_sweep_outside_window_does_nothing() {
        let purge = Arc::new(RecordingPurge::default());
        let sweeper = RetentionSweeper::new(purge.clone(), CleanerConfig::default(), "test");

        assert_eq!(sweeper.sweep_at(local(12, 0)).await.unwrap(), None);
        assert!(purge.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_inside_window_uses_retention_and_batch() {
        let purge = Arc::new(RecordingPurge::default());
        let sweeper = RetentionSweeper::new(purge.clone(), CleanerConfig::default(), "test");
        let now = local(1, 10);

        assert_eq!(sweeper.sweep_at(now).await.unwrap(), Some(7));

        let calls = purge.calls.lock().await;
        assert_eq!(calls.len(), 1);
        let (cutoff, limit) = calls[0];
        assert_eq!(limit, 1000);
        assert_eq!(cutoff, now.with_timezone(&Utc) - chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn test_sweep_error_is_returned_not_panicking() {
        let purge = Arc::new(RecordingPurge {
            fail: true,
            ..Default::default()
        });
        let sweeper = RetentionSweeper::new(purge, CleanerConfig::default(), "test");
        assert!(sweeper.sweep_at(local(1, 5)).await.is_err());
    }

    #[tokio::test]
    async fn test_held_lock_prevents_start() {
        let purge = Arc::new(RecordingPurge::default());
        let sweeper = RetentionSweeper::new(purge, CleanerConfig::default(), "coderuncleaner");
        assert!(sweeper.start(&HeldLock).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_sweeper_does_not_start() {
        let purge = Arc::new(RecordingPurge::default());
        let config = CleanerConfig {
            enabled: false,
            ..Default::default()
        };
        let sweeper = RetentionSweeper::new(purge, config, "test");
        assert!(sweeper.start(&LocalLock).await.is_none());
    }

    #[tokio::test]
    async fn test_loop_ticks_and_shuts_down() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl Purge for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
            async fn delete_older(&self, _: DateTime<Utc>, _: i64) -> Result<u64> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }
        }

        // open the window at the start of the current minute so every tick sweeps
        let now = Local::now().naive_local();
        let config = CleanerConfig {
            schedule_time: NaiveTime::from_hms_opt(now.hour(), now.minute(), 0).unwrap(),
            tick: Duration::from_millis(10),
            ..Default::default()
        };
        let purge = Arc::new(Counting(AtomicUsize::new(0)));
        let sweeper = RetentionSweeper::new(purge.clone(), config, "test");

        let (handle, shutdown) = sweeper.start(&LocalLock).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(purge.0.load(Ordering::SeqCst) >= 1);
    }
}
