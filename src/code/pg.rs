use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Code, CodeRepository, CodeType, DEFAULT_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::ids::RecordId;

const COLUMNS: &str =
    "id, name, type, source, language, url, project_uuid, timeout, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct CodeRow {
    id: Uuid,
    name: String,
    #[sqlx(rename = "type")]
    code_type: String,
    source: String,
    language: String,
    url: String,
    project_uuid: String,
    timeout: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CodeRow> for Code {
    type Error = Error;

    fn try_from(row: CodeRow) -> Result<Self> {
        Ok(Code {
            id: row.id.to_string(),
            name: row.name,
            code_type: row.code_type.parse()?,
            source: row.source,
            language: row.language.parse()?,
            url: row.url,
            project_uuid: row.project_uuid,
            timeout: if row.timeout == 0 {
                DEFAULT_TIMEOUT_SECS
            } else {
                row.timeout as i64
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgCodeRepository {
    pool: PgPool,
}

impl PgCodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CodeRepository for PgCodeRepository {
    async fn create(&self, code: Code) -> Result<Code> {
        let legacy = match RecordId::parse(&code.id) {
            Ok(RecordId::Legacy(oid)) => Some(oid),
            _ => None,
        };

        let row = sqlx::query_as::<_, CodeRow>(&format!(
            r#"
            INSERT INTO codes (id, mongo_object_id, name, type, source, language, url, project_uuid, timeout, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(legacy)
        .bind(&code.name)
        .bind(code.code_type.as_str())
        .bind(&code.source)
        .bind(code.language.as_str())
        .bind(&code.url)
        .bind(&code.project_uuid)
        .bind(code.timeout as i32)
        .bind(code.created_at)
        .bind(code.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_by_id(&self, id: &str) -> Result<Code> {
        let record = RecordId::parse(id)?;
        let row = sqlx::query_as::<_, CodeRow>(&format!(
            "SELECT {COLUMNS} FROM codes WHERE {}",
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::not_found(format!("code {}", id)))?
            .try_into()
    }

    async fn list_by_project(&self, project_uuid: &str, code_type: Option<CodeType>) -> Result<Vec<Code>> {
        let rows = sqlx::query_as::<_, CodeRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM codes
            WHERE project_uuid = $1 AND ($2::text IS NULL OR type = $2)
            ORDER BY created_at DESC
            "#
        ))
        .bind(project_uuid)
        .bind(code_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Code::try_from).collect()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let record = RecordId::parse(id)?;
        let result = sqlx::query(&format!("DELETE FROM codes WHERE {}", record.sql_match(1)))
            .bind(record.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("code {}", id)));
        }
        Ok(())
    }
}
