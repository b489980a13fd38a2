//! PostgreSQL run store.
//!
//! Rows have a UUID primary key. Runs migrated from the document store keep
//! their object id in `mongo_object_id`, so lookups accept either form.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{CodeRun, CodeRunRepository, RunFilter};
use crate::error::{Error, Result};
use crate::ids::RecordId;

const COLUMNS: &str =
    "id, code_id, status, result, extra, params, body, headers, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct CodeRunRow {
    id: Uuid,
    code_id: String,
    status: String,
    result: String,
    extra: Json<Map<String, Value>>,
    params: Json<Map<String, Value>>,
    body: String,
    headers: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CodeRunRow> for CodeRun {
    type Error = Error;

    fn try_from(row: CodeRunRow) -> Result<Self> {
        Ok(CodeRun {
            id: row.id.to_string(),
            code_id: row.code_id,
            status: row.status.parse()?,
            result: row.result,
            extra: row.extra.0,
            params: row.params.0,
            body: row.body,
            headers: row.headers.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgCodeRunRepository {
    pool: PgPool,
}

impl PgCodeRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CodeRunRepository for PgCodeRunRepository {
    async fn create(&self, run: CodeRun) -> Result<CodeRun> {
        // A caller-supplied object id is kept as the legacy key.
        let (id, legacy) = match RecordId::parse(&run.id) {
            Ok(RecordId::Native(id)) => (id, None),
            Ok(RecordId::Legacy(oid)) => (Uuid::new_v4(), Some(oid)),
            Err(_) => (Uuid::new_v4(), None),
        };

        let row = sqlx::query_as::<_, CodeRunRow>(&format!(
            r#"
            INSERT INTO coderuns (id, mongo_object_id, code_id, status, result, extra, params, body, headers, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id)
        .bind(legacy)
        .bind(&run.code_id)
        .bind(run.status.as_str())
        .bind(&run.result)
        .bind(Json(&run.extra))
        .bind(Json(&run.params))
        .bind(&run.body)
        .bind(Json(&run.headers))
        .bind(run.created_at)
        .bind(run.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeRun> {
        let record = RecordId::parse(id)?;
        let row = sqlx::query_as::<_, CodeRunRow>(&format!(
            "SELECT {COLUMNS} FROM coderuns WHERE {}",
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::not_found(format!("coderun {}", id)))?
            .try_into()
    }

    async fn list_by_code_id(&self, code_id: &str, filter: RunFilter) -> Result<Vec<CodeRun>> {
        let rows = sqlx::query_as::<_, CodeRunRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM coderuns
            WHERE code_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at <= $3)
            ORDER BY created_at DESC
            "#
        ))
        .bind(code_id)
        .bind(filter.after)
        .bind(filter.before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CodeRun::try_from).collect()
    }

    async fn update(&self, run: &CodeRun) -> Result<CodeRun> {
        let record = RecordId::parse(&run.id)?;
        let row = sqlx::query_as::<_, CodeRunRow>(&format!(
            r#"
            UPDATE coderuns
            SET status = $2, result = $3, extra = $4, params = $5, body = $6, headers = $7, updated_at = $8
            WHERE {}
            RETURNING {COLUMNS}
            "#,
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .bind(run.status.as_str())
        .bind(&run.result)
        .bind(Json(&run.extra))
        .bind(Json(&run.params))
        .bind(&run.body)
        .bind(Json(&run.headers))
        .bind(run.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::not_found(format!("coderun {}", run.id)))?
            .try_into()
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let record = RecordId::parse(id)?;
        let result = sqlx::query(&format!(
            "DELETE FROM coderuns WHERE {}",
            record.sql_match(1)
        ))
        .bind(record.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("coderun {}", id)));
        }
        Ok(())
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM coderuns
            WHERE id IN (
                SELECT id FROM coderuns
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
