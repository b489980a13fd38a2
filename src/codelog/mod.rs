//! Code logs - append-only entries emitted while a run executes

pub mod memory;
pub mod mongo;
pub mod pg;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sweeper::Purge;

/// Longest content kept per entry, in characters.
pub const MAX_CONTENT_CHARS: usize = 8000;

pub const DEFAULT_PAGE_LIMIT: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Debug,
    Info,
    Error,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "error" => Ok(Self::Error),
            other => Err(Error::Other(format!("unknown log type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLog {
    #[serde(default)]
    pub id: String,
    pub run_id: String,
    pub code_id: String,
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeLog {
    pub fn new(
        run_id: impl Into<String>,
        code_id: impl Into<String>,
        log_type: LogType,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            run_id: run_id.into(),
            code_id: code_id.into(),
            log_type,
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which run and/or code a log query is about. Empty strings mean "any".
#[derive(Debug, Clone, Copy)]
pub struct LogScope<'a> {
    pub run_id: &'a str,
    pub code_id: &'a str,
}

impl<'a> LogScope<'a> {
    pub fn new(run_id: &'a str, code_id: &'a str) -> Result<Self> {
        if run_id.trim().is_empty() && code_id.trim().is_empty() {
            return Err(Error::validation("must specify a run_id or a code_id"));
        }
        Ok(Self { run_id, code_id })
    }

    pub fn matches(&self, log: &CodeLog) -> bool {
        (self.run_id.is_empty() || log.run_id == self.run_id)
            && (self.code_id.is_empty() || log.code_id == self.code_id)
    }
}

/// Zero-based `[start, end)` window of page `page` (1-based) of size `limit`.
pub fn page_window(limit: i64, page: i64) -> (usize, usize) {
    let limit = limit.max(1) as usize;
    let page = page.max(1) as usize;
    let start = (page - 1) * limit;
    (start, start + limit)
}

pub fn truncate_content(content: &str) -> String {
    match content.char_indices().nth(MAX_CONTENT_CHARS) {
        Some((cut, _)) => content[..cut].to_string(),
        None => content.to_string(),
    }
}

#[async_trait]
pub trait CodeLogRepository: Send + Sync {
    /// Store a new entry, assigning id and timestamps when absent.
    async fn create(&self, log: CodeLog) -> Result<CodeLog>;
    async fn get_by_id(&self, id: &str) -> Result<CodeLog>;
    /// Newest first, one page.
    async fn list_run_logs(&self, scope: LogScope<'_>, limit: i64, page: i64) -> Result<Vec<CodeLog>>;
    async fn count(&self, scope: LogScope<'_>) -> Result<i64>;
    async fn update(&self, id: &str, content: &str) -> Result<CodeLog>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Delete at most `limit` entries created before `cutoff`, oldest first.
    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;
}

#[derive(Clone)]
pub struct CodeLogService {
    repo: Arc<dyn CodeLogRepository>,
}

impl CodeLogService {
    pub fn new(repo: Arc<dyn CodeLogRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, mut log: CodeLog) -> Result<CodeLog> {
        log.content = truncate_content(&log.content);
        self.repo.create(log).await
    }

    /// Convenience for the executing worker.
    pub async fn emit(
        &self,
        run_id: &str,
        code_id: &str,
        log_type: LogType,
        content: impl Into<String>,
    ) -> Result<CodeLog> {
        self.create(CodeLog::new(run_id, code_id, log_type, content))
            .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<CodeLog> {
        if id.trim().is_empty() {
            return Err(Error::validation("valid id is required"));
        }
        self.repo.get_by_id(id).await
    }

    pub async fn list_run_logs(
        &self,
        run_id: &str,
        code_id: &str,
        limit: i64,
        page: i64,
    ) -> Result<Vec<CodeLog>> {
        let scope = LogScope::new(run_id, code_id)?;
        let limit = if limit < 1 { DEFAULT_PAGE_LIMIT } else { limit };
        self.repo.list_run_logs(scope, limit, page.max(1)).await
    }

    pub async fn count(&self, run_id: &str, code_id: &str) -> Result<i64> {
        let scope = LogScope::new(run_id, code_id)?;
        self.repo.count(scope).await
    }

    pub async fn update(&self, id: &str, content: &str) -> Result<CodeLog> {
        self.repo.update(id, &truncate_content(content)).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repo.delete(id).await
    }
}

#[async_trait]
impl Purge for CodeLogService {
    fn name(&self) -> &'static str {
        "codelog"
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        self.repo.delete_older(cutoff, limit).await
    }
}
