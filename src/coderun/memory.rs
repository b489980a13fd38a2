use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CodeRun, CodeRunRepository, RunFilter};
use crate::error::{Error, Result};
use crate::ids::{new_object_id, RecordId};

/// In-process run store keyed by object id.
#[derive(Default)]
pub struct MemoryCodeRunRepository {
    runs: RwLock<HashMap<String, CodeRun>>,
}

impl MemoryCodeRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}

fn key(id: &str) -> Result<String> {
    Ok(RecordId::parse(id)?.to_string())
}

#[async_trait]
impl CodeRunRepository for MemoryCodeRunRepository {
    async fn create(&self, mut run: CodeRun) -> Result<CodeRun> {
        if run.id.is_empty() {
            run.id = new_object_id();
        }
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeRun> {
        let key = key(id)?;
        self.runs
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("coderun {}", id)))
    }

    async fn list_by_code_id(&self, code_id: &str, filter: RunFilter) -> Result<Vec<CodeRun>> {
        let mut runs: Vec<CodeRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.code_id == code_id && filter.matches(run.created_at))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn update(&self, run: &CodeRun) -> Result<CodeRun> {
        let key = key(&run.id)?;
        let mut runs = self.runs.write().await;
        match runs.get_mut(&key) {
            Some(stored) => {
                *stored = run.clone();
                Ok(stored.clone())
            }
            None => Err(Error::not_found(format!("coderun {}", run.id))),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let key = key(id)?;
        self.runs
            .write()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("coderun {}", id)))
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let mut runs = self.runs.write().await;
        let mut expired: Vec<(DateTime<Utc>, String)> = runs
            .values()
            .filter(|run| run.created_at < cutoff)
            .map(|run| (run.created_at, run.id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit.max(0) as usize);

        for (_, id) in &expired {
            runs.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
