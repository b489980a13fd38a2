//! Code runs - one execution attempt of a code snippet
//!
//! A run is created `queued` by the orchestrator and from then on only the
//! worker executing it writes to it:
//!
//! ```text
//! queued -> started -> completed
//!                   \-> failed
//! ```
//!
//! Nothing ever moves back to `queued` and `started` is never skipped.

pub mod memory;
pub mod mongo;
pub mod pg;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::sweeper::Purge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeRunStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl CodeRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: CodeRunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Started)
                | (Self::Started, Self::Completed)
                | (Self::Started, Self::Failed)
        )
    }
}

impl fmt::Display for CodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CodeRunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Other(format!("unknown code run status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRun {
    #[serde(default)]
    pub id: String,
    pub code_id: String,
    pub status: CodeRunStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CodeRun {
    /// A fresh `queued` run; the repository assigns the id.
    pub fn new(code_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            code_id: code_id.into(),
            status: CodeRunStatus::Queued,
            result: String::new(),
            extra: Map::new(),
            params: Map::new(),
            body: String::new(),
            headers: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(CodeRunStatus::Started)
    }

    pub fn complete(&mut self, result: impl Into<String>) -> Result<()> {
        self.transition(CodeRunStatus::Completed)?;
        self.result = result.into();
        Ok(())
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> Result<()> {
        self.transition(CodeRunStatus::Failed)?;
        let detail = detail.into();
        self.extra
            .insert("error".to_string(), Value::String(detail.clone()));
        self.result = detail;
        Ok(())
    }

    fn transition(&mut self, next: CodeRunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// HTTP status the action asked for, from `extra.status_code`.
    pub fn status_code(&self) -> Option<u16> {
        match self.extra.get("status_code")? {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Response content type hint from `extra.content_type`.
    pub fn response_content_type(&self) -> &str {
        self.extra
            .get("content_type")
            .and_then(Value::as_str)
            .unwrap_or("string")
    }
}

/// Optional creation-time bounds for [`CodeRunRepository::list_by_code_id`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn matches(&self, created_at: DateTime<Utc>) -> bool {
        self.after.map_or(true, |after| created_at >= after)
            && self.before.map_or(true, |before| created_at <= before)
    }
}

/// Persistence contract for runs. Implementations accept both identifier
/// forms (see [`crate::ids::RecordId`]) wherever an id is looked up.
#[async_trait]
pub trait CodeRunRepository: Send + Sync {
    async fn create(&self, run: CodeRun) -> Result<CodeRun>;
    async fn get_by_id(&self, id: &str) -> Result<CodeRun>;
    /// Newest first.
    async fn list_by_code_id(&self, code_id: &str, filter: RunFilter) -> Result<Vec<CodeRun>>;
    async fn update(&self, run: &CodeRun) -> Result<CodeRun>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Delete at most `limit` runs created before `cutoff`, oldest first.
    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64>;
}

#[derive(Clone)]
pub struct CodeRunService {
    repo: Arc<dyn CodeRunRepository>,
}

impl CodeRunService {
    pub fn new(repo: Arc<dyn CodeRunRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, run: CodeRun) -> Result<CodeRun> {
        self.repo.create(run).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<CodeRun> {
        if id.trim().is_empty() {
            return Err(Error::validation("valid id is required"));
        }
        self.repo.get_by_id(id).await
    }

    pub async fn list_by_code_id(&self, code_id: &str, filter: RunFilter) -> Result<Vec<CodeRun>> {
        if code_id.trim().is_empty() {
            return Err(Error::validation("valid code_id is required"));
        }
        self.repo.list_by_code_id(code_id, filter).await
    }

    pub async fn update(&self, run: &CodeRun) -> Result<CodeRun> {
        self.repo.update(run).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repo.delete(id).await
    }
}

#[async_trait]
impl Purge for CodeRunService {
    fn name(&self) -> &'static str {
        "coderun"
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        self.repo.delete_older(cutoff, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_forward_transitions() {
        let mut run = CodeRun::new("code-1");
        assert_eq!(run.status, CodeRunStatus::Queued);

        run.start().unwrap();
        assert_eq!(run.status, CodeRunStatus::Started);

        run.complete("42").unwrap();
        assert_eq!(run.status, CodeRunStatus::Completed);
        assert_eq!(run.result, "42");
    }

    #[test]
    fn test_cannot_skip_started() {
        let mut run = CodeRun::new("code-1");
        let err = run.complete("too early").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: CodeRunStatus::Queued,
                to: CodeRunStatus::Completed
            }
        ));
        assert!(run.fail("nope").is_err());
        assert_eq!(run.status, CodeRunStatus::Queued);
        assert!(run.result.is_empty());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = CodeRun::new("code-1");
        run.start().unwrap();
        run.fail("boom").unwrap();
        assert_eq!(run.status, CodeRunStatus::Failed);
        assert_eq!(run.extra["error"], json!("boom"));

        assert!(run.start().is_err());
        assert!(run.complete("late").is_err());
        assert_eq!(run.status, CodeRunStatus::Failed);
        assert_eq!(run.result, "boom");
    }

    #[test]
    fn test_transition_table() {
        use CodeRunStatus::*;
        let all = [Queued, Started, Completed, Failed];
        for from in all {
            for to in all {
                let allowed = from.can_transition_to(to);
                let expected = matches!(
                    (from, to),
                    (Queued, Started) | (Started, Completed) | (Started, Failed)
                );
                assert_eq!(allowed, expected, "{} -> {}", from, to);
            }
        }
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Started.is_terminal());
    }

    #[test]
    fn test_transition_refreshes_updated_at() {
        let mut run = CodeRun::new("code-1");
        let before = run.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        run.start().unwrap();
        assert!(run.updated_at > before);
    }

    #[test]
    fn test_status_code_from_extra() {
        let mut run = CodeRun::new("code-1");
        assert_eq!(run.status_code(), None);

        run.extra.insert("status_code".into(), json!(201));
        assert_eq!(run.status_code(), Some(201));

        run.extra.insert("status_code".into(), json!("404"));
        assert_eq!(run.status_code(), Some(404));

        run.extra.insert("status_code".into(), json!(["bad"]));
        assert_eq!(run.status_code(), None);
    }

    #[test]
    fn test_response_content_type() {
        let mut run = CodeRun::new("code-1");
        assert_eq!(run.response_content_type(), "string");
        run.extra.insert("content_type".into(), json!("json"));
        assert_eq!(run.response_content_type(), "json");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&CodeRunStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let parsed: CodeRunStatus = "started".parse().unwrap();
        assert_eq!(parsed, CodeRunStatus::Started);
        assert!("running".parse::<CodeRunStatus>().is_err());
    }

    #[test]
    fn test_run_filter() {
        let now = Utc::now();
        let filter = RunFilter {
            after: Some(now - chrono::Duration::hours(1)),
            before: Some(now),
        };
        assert!(filter.matches(now - chrono::Duration::minutes(5)));
        assert!(!filter.matches(now - chrono::Duration::hours(2)));
        assert!(!filter.matches(now + chrono::Duration::minutes(1)));
        assert!(RunFilter::default().matches(now));
    }
}
