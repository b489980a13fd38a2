use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{page_window, CodeLog, CodeLogRepository, LogScope};
use crate::error::{Error, Result};
use crate::ids::new_object_id;

#[derive(Default)]
pub struct MemoryCodeLogRepository {
    logs: RwLock<HashMap<String, CodeLog>>,
}

impl MemoryCodeLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn scoped(&self, scope: LogScope<'_>) -> Vec<CodeLog> {
        let mut logs: Vec<CodeLog> = self
            .logs
            .read()
            .await
            .values()
            .filter(|log| scope.matches(log))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs
    }
}

#[async_trait]
impl CodeLogRepository for MemoryCodeLogRepository {
    async fn create(&self, mut log: CodeLog) -> Result<CodeLog> {
        if log.id.is_empty() {
            log.id = new_object_id();
        }
        let mut logs = self.logs.write().await;
        if logs.contains_key(&log.id) {
            return Err(Error::validation(format!("codelog {} already exists", log.id)));
        }
        logs.insert(log.id.clone(), log.clone());
        Ok(log)
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeLog> {
        self.logs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))
    }

    async fn list_run_logs(&self, scope: LogScope<'_>, limit: i64, page: i64) -> Result<Vec<CodeLog>> {
        let logs = self.scoped(scope).await;
        let (start, end) = page_window(limit, page);
        Ok(logs.into_iter().skip(start).take(end - start).collect())
    }

    async fn count(&self, scope: LogScope<'_>) -> Result<i64> {
        Ok(self.scoped(scope).await.len() as i64)
    }

    async fn update(&self, id: &str, content: &str) -> Result<CodeLog> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))?;
        log.content = content.to_string();
        log.updated_at = Utc::now();
        Ok(log.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.logs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let mut logs = self.logs.write().await;
        let mut expired: Vec<(DateTime<Utc>, String)> = logs
            .values()
            .filter(|log| log.created_at < cutoff)
            .map(|log| (log.created_at, log.id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit.max(0) as usize);

        for (_, id) in &expired {
            logs.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
