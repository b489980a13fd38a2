//! Code registry - the snippets that can be invoked

pub mod memory;
pub mod mongo;
pub mod pg;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest accepted source, in bytes.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

/// Seconds a run may take when the code sets no timeout.
pub const DEFAULT_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    Flow,
    Endpoint,
}

impl CodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Endpoint => "endpoint",
        }
    }
}

impl std::str::FromStr for CodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flow" => Ok(Self::Flow),
            "endpoint" => Ok(Self::Endpoint),
            other => Err(Error::validation(format!("code type of ({}) is not valid", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Go,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::Go => "go",
        }
    }
}

impl std::str::FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "python" => Ok(Self::Python),
            "javascript" => Ok(Self::JavaScript),
            "go" => Ok(Self::Go),
            other => Err(Error::validation(format!("language type ({}) is not valid", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub code_type: CodeType,
    pub source: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub project_uuid: String,
    /// Seconds
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_timeout() -> i64 {
    DEFAULT_TIMEOUT_SECS
}

impl Code {
    pub fn new(
        name: impl Into<String>,
        code_type: CodeType,
        language: Language,
        source: impl Into<String>,
        project_uuid: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            code_type,
            source: source.into(),
            language,
            url: String::new(),
            project_uuid: project_uuid.into(),
            timeout: DEFAULT_TIMEOUT_SECS,
            created_at: now,
            updated_at: now,
        }
    }

    /// Run deadline; non-positive values fall back to the default.
    pub fn timeout(&self) -> std::time::Duration {
        let secs = if self.timeout > 0 {
            self.timeout
        } else {
            DEFAULT_TIMEOUT_SECS
        };
        std::time::Duration::from_secs(secs as u64)
    }
}

#[async_trait]
pub trait CodeRepository: Send + Sync {
    async fn create(&self, code: Code) -> Result<Code>;
    async fn get_by_id(&self, id: &str) -> Result<Code>;
    async fn list_by_project(&self, project_uuid: &str, code_type: Option<CodeType>) -> Result<Vec<Code>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct CodeService {
    repo: Arc<dyn CodeRepository>,
}

impl CodeService {
    pub fn new(repo: Arc<dyn CodeRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(&self, mut code: Code) -> Result<Code> {
        if code.name.trim().is_empty() {
            return Err(Error::validation("name is required"));
        }
        if code.project_uuid.trim().is_empty() {
            return Err(Error::validation("project_uuid is required"));
        }
        if code.source.len() >= MAX_SOURCE_BYTES {
            return Err(Error::validation("source code is too big"));
        }
        if code.timeout <= 0 {
            code.timeout = DEFAULT_TIMEOUT_SECS;
        }
        self.repo.create(code).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Code> {
        self.repo.get_by_id(id).await
    }

    pub async fn list_by_project(&self, project_uuid: &str, code_type: Option<CodeType>) -> Result<Vec<Code>> {
        if project_uuid.trim().is_empty() {
            return Err(Error::validation("project_uuid is required"));
        }
        self.repo.list_by_project(project_uuid, code_type).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.repo.delete(id).await
    }
}
