//! Object-store backed code logs.
//!
//! Each entry is one JSON object under a date partition:
//!
//! ```text
//! {prefix}/logs/YYYY/MM/DD/{run_id}/{code_id}/{log_id}.json
//! ```
//!
//! There is no secondary index, so lookups by id scan a bounded number of
//! trailing day partitions. Buckets whose name contains `-` may also hold
//! entries written under `{bucket}/{prefix}/logs/...` by older deployments
//! that had the bucket baked into the endpoint; those are searched too.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use tracing::{debug, warn};

use super::{page_window, CodeLog, CodeLogRepository, LogScope};
use crate::error::{Error, Result};
use crate::ids::new_object_id;
use crate::storage::ObjectStore;

const LOOKUP_DAYS: i64 = 30;
const LIST_DAYS: i64 = 7;
const COUNT_DAYS: i64 = 30;
const MAX_SWEEP_DAYS: i64 = 365;

pub struct S3CodeLogRepository {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

fn storage_error(err: anyhow::Error) -> Error {
    Error::Storage(format!("{:#}", err))
}

fn join(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn day_path(date: NaiveDate) -> String {
    format!("{:04}/{:02}/{:02}", date.year(), date.month(), date.day())
}

/// Matches the `{run_id}/{code_id}/{log_id}.json` tail of a key.
fn key_matches(key: &str, scope: LogScope<'_>) -> bool {
    if !key.ends_with(".json") {
        return false;
    }
    let mut segments = key.rsplit('/').skip(1);
    let (Some(code_id), Some(run_id)) = (segments.next(), segments.next()) else {
        return false;
    };
    (scope.run_id.is_empty() || run_id == scope.run_id)
        && (scope.code_id.is_empty() || code_id == scope.code_id)
}

impl S3CodeLogRepository {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    fn object_key(&self, log: &CodeLog) -> String {
        let day = day_path(log.created_at.date_naive());
        let file = format!("{}.json", log.id);
        join(&[&self.prefix, "logs", &day, &log.run_id, &log.code_id, &file])
    }

    /// Prefixes to list for one day, legacy layout first.
    fn search_prefixes(&self, date: NaiveDate, scope: Option<LogScope<'_>>) -> Vec<String> {
        let day = day_path(date);
        let (run_id, code_id) = match scope {
            // code_id only narrows the path when run_id is known
            Some(scope) if !scope.run_id.is_empty() => (scope.run_id, scope.code_id),
            _ => ("", ""),
        };

        let mut prefixes = Vec::with_capacity(2);
        if self.bucket.contains('-') {
            prefixes.push(join(&[&self.bucket, &self.prefix, "logs", &day, run_id, code_id]) + "/");
        }
        prefixes.push(join(&[&self.prefix, "logs", &day, run_id, code_id]) + "/");
        prefixes
    }

    /// Trailing day partitions starting today (UTC).
    fn trailing_days(days: i64) -> impl Iterator<Item = NaiveDate> {
        let today = Utc::now().date_naive();
        (0..days).map(move |i| today - Duration::days(i))
    }

    async fn locate(&self, id: &str) -> Option<String> {
        let file = format!("/{}.json", id);
        for date in Self::trailing_days(LOOKUP_DAYS) {
            for prefix in self.search_prefixes(date, None) {
                match self.store.list(&prefix).await {
                    Ok(objects) => {
                        if let Some(found) = objects.into_iter().find(|o| o.key.ends_with(&file)) {
                            return Some(found.key);
                        }
                    }
                    Err(e) => debug!(prefix = %prefix, "codelog lookup skipped prefix: {:#}", e),
                }
            }
        }
        None
    }

    async fn fetch(&self, key: &str) -> Result<CodeLog> {
        let body = self.store.get(key).await.map_err(storage_error)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn write(&self, key: &str, log: &CodeLog) -> Result<()> {
        let body = serde_json::to_vec(log)?;
        let metadata = HashMap::from([
            ("run-id".to_string(), log.run_id.clone()),
            ("code-id".to_string(), log.code_id.clone()),
            ("log-type".to_string(), log.log_type.as_str().to_string()),
            ("created-at".to_string(), log.created_at.to_rfc3339()),
        ]);
        self.store
            .put(key, body, metadata)
            .await
            .map_err(storage_error)
    }
}

#[async_trait]
impl CodeLogRepository for S3CodeLogRepository {
    async fn create(&self, mut log: CodeLog) -> Result<CodeLog> {
        if log.id.is_empty() {
            log.id = new_object_id();
        } else if self.locate(&log.id).await.is_some() {
            return Err(Error::validation(format!("codelog {} already exists", log.id)));
        }

        let key = self.object_key(&log);
        self.write(&key, &log).await?;
        Ok(log)
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeLog> {
        if id.is_empty() {
            return Err(Error::validation("invalid log id: empty string"));
        }
        let key = self
            .locate(id)
            .await
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))?;
        self.fetch(&key).await
    }

    async fn list_run_logs(&self, scope: LogScope<'_>, limit: i64, page: i64) -> Result<Vec<CodeLog>> {
        let mut logs = Vec::new();
        for date in Self::trailing_days(LIST_DAYS) {
            for prefix in self.search_prefixes(date, Some(scope)) {
                let objects = match self.store.list(&prefix).await {
                    Ok(objects) => objects,
                    Err(e) => {
                        debug!(prefix = %prefix, "codelog listing skipped prefix: {:#}", e);
                        continue;
                    }
                };
                for object in objects.iter().filter(|o| key_matches(&o.key, scope)) {
                    match self.fetch(&object.key).await {
                        Ok(log) if scope.matches(&log) => logs.push(log),
                        Ok(_) => {}
                        Err(e) => warn!(key = %object.key, "skipping unreadable codelog: {}", e),
                    }
                }
            }
        }

        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let (start, end) = page_window(limit, page);
        Ok(logs.into_iter().skip(start).take(end - start).collect())
    }

    async fn count(&self, scope: LogScope<'_>) -> Result<i64> {
        let mut count = 0;
        for date in Self::trailing_days(COUNT_DAYS) {
            for prefix in self.search_prefixes(date, Some(scope)) {
                if let Ok(objects) = self.store.list(&prefix).await {
                    count += objects.iter().filter(|o| key_matches(&o.key, scope)).count() as i64;
                }
            }
        }
        Ok(count)
    }

    async fn update(&self, id: &str, content: &str) -> Result<CodeLog> {
        let key = self
            .locate(id)
            .await
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))?;
        let mut log = self.fetch(&key).await?;
        log.content = content.to_string();
        log.updated_at = Utc::now();

        self.write(&key, &log).await?;
        Ok(log)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let key = self
            .locate(id)
            .await
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))?;
        self.store.delete(&key).await.map_err(storage_error)
    }

    /// Walks day partitions forward, starting `MAX_SWEEP_DAYS` before the
    /// cutoff, so a bounded sweep always removes the oldest entries first.
    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let limit = limit.max(0) as u64;
        let mut deleted = 0u64;
        let last = cutoff.date_naive();
        let mut date = last - Duration::days(MAX_SWEEP_DAYS - 1);

        while date <= last && deleted < limit {
            let mut expired = Vec::new();
            for prefix in self.search_prefixes(date, None) {
                let Ok(objects) = self.store.list(&prefix).await else {
                    continue;
                };
                expired.extend(objects.into_iter().filter_map(|o| match o.last_modified {
                    Some(at) if at < cutoff => Some((at, o.key)),
                    _ => None,
                }));
            }
            expired.sort();

            for (_, key) in expired {
                if deleted >= limit {
                    break;
                }
                match self.store.delete(&key).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(key = %key, "failed to delete codelog: {:#}", e),
                }
            }
            date += Duration::days(1);
        }
        Ok(deleted)
    }
}
