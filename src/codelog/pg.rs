use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{page_window, CodeLog, CodeLogRepository, LogScope};
use crate::error::{Error, Result};
use crate::ids::RecordId;

const COLUMNS: &str = "id, run_id, code_id, type, content, created_at, updated_at";

const SCOPE: &str = "($1 = '' OR run_id = $1) AND ($2 = '' OR code_id = $2)";

#[derive(sqlx::FromRow)]
struct CodeLogRow {
    id: Uuid,
    run_id: String,
    code_id: String,
    #[sqlx(rename = "type")]
    log_type: String,
    content: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CodeLogRow> for CodeLog {
    type Error = Error;

    fn try_from(row: CodeLogRow) -> Result<Self> {
        Ok(CodeLog {
            id: row.id.to_string(),
            run_id: row.run_id,
            code_id: row.code_id,
            log_type: row.log_type.parse()?,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgCodeLogRepository {
    pool: PgPool,
}

impl PgCodeLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CodeLogRepository for PgCodeLogRepository {
    async fn create(&self, log: CodeLog) -> Result<CodeLog> {
        let (id, legacy) = match RecordId::parse(&log.id) {
            Ok(RecordId::Native(id)) => (id, None),
            Ok(RecordId::Legacy(oid)) => (Uuid::new_v4(), Some(oid)),
            Err(_) => (Uuid::new_v4(), None),
        };

        let row = sqlx::query_as::<_, CodeLogRow>(&format!(
            r#"
            INSERT INTO codelogs (id, mongo_object_id, run_id, code_id, type, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(legacy)
        .bind(&log.run_id)
        .bind(&log.code_id)
        .bind(log.log_type.as_str())
        .bind(&log.content)
        .bind(log.created_at)
        .bind(log.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeLog> {
        let record = RecordId::parse(id)?;
        let row = sqlx::query_as::<_, CodeLogRow>(&format!(
            "SELECT {COLUMNS} FROM codelogs WHERE {}",
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::not_found(format!("codelog {}", id)))?
            .try_into()
    }

    async fn list_run_logs(&self, scope: LogScope<'_>, limit: i64, page: i64) -> Result<Vec<CodeLog>> {
        let (start, end) = page_window(limit, page);
        let rows = sqlx::query_as::<_, CodeLogRow>(&format!(
            "SELECT {COLUMNS} FROM codelogs WHERE {SCOPE} ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        ))
        .bind(scope.run_id)
        .bind(scope.code_id)
        .bind((end - start) as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CodeLog::try_from).collect()
    }

    async fn count(&self, scope: LogScope<'_>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM codelogs WHERE {SCOPE}"))
            .bind(scope.run_id)
            .bind(scope.code_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn update(&self, id: &str, content: &str) -> Result<CodeLog> {
        let record = RecordId::parse(id)?;
        let row = sqlx::query_as::<_, CodeLogRow>(&format!(
            "UPDATE codelogs SET content = $2, updated_at = NOW() WHERE {} RETURNING {COLUMNS}",
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .bind(content)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::not_found(format!("codelog {}", id)))?
            .try_into()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let record = RecordId::parse(id)?;
        let result = sqlx::query(&format!(
            "DELETE FROM codelogs WHERE {}",
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("codelog {}", id)));
        }
        Ok(())
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM codelogs
            WHERE id IN (
                SELECT id FROM codelogs
                WHERE created_at < $1
                ORDER BY created_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
