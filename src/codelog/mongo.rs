use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use super::{page_window, CodeLog, CodeLogRepository, LogScope, LogType};
use crate::db::{from_bson_date, from_bson_id, to_bson_date, to_bson_id};
use crate::error::{Error, Result};
use crate::ids::new_object_id;

/// `_id`, `run_id` and `code_id` are BSON object ids.
#[derive(Debug, Serialize, Deserialize)]
struct CodeLogDocument {
    #[serde(rename = "_id")]
    id: Bson,
    run_id: Bson,
    code_id: Bson,
    #[serde(rename = "type")]
    log_type: LogType,
    content: String,
    created_at: bson::DateTime,
    updated_at: bson::DateTime,
}

impl From<&CodeLog> for CodeLogDocument {
    fn from(log: &CodeLog) -> Self {
        Self {
            id: to_bson_id(&log.id),
            run_id: to_bson_id(&log.run_id),
            code_id: to_bson_id(&log.code_id),
            log_type: log.log_type,
            content: log.content.clone(),
            created_at: to_bson_date(log.created_at),
            updated_at: to_bson_date(log.updated_at),
        }
    }
}

impl From<CodeLogDocument> for CodeLog {
    fn from(doc: CodeLogDocument) -> Self {
        Self {
            id: from_bson_id(doc.id),
            run_id: from_bson_id(doc.run_id),
            code_id: from_bson_id(doc.code_id),
            log_type: doc.log_type,
            content: doc.content,
            created_at: from_bson_date(doc.created_at),
            updated_at: from_bson_date(doc.updated_at),
        }
    }
}

pub struct MongoCodeLogRepository {
    collection: Collection<CodeLogDocument>,
}

impl MongoCodeLogRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("codelog"),
        }
    }
}

fn scope_filter(scope: LogScope<'_>) -> Document {
    let mut filter = Document::new();
    if !scope.run_id.is_empty() {
        filter.insert("run_id", to_bson_id(scope.run_id));
    }
    if !scope.code_id.is_empty() {
        filter.insert("code_id", to_bson_id(scope.code_id));
    }
    filter
}

#[async_trait]
impl CodeLogRepository for MongoCodeLogRepository {
    async fn create(&self, mut log: CodeLog) -> Result<CodeLog> {
        if log.id.is_empty() {
            log.id = new_object_id();
        }
        // insert_one fails on a duplicate _id, so nothing is overwritten
        self.collection.insert_one(CodeLogDocument::from(&log)).await?;
        Ok(log)
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeLog> {
        self.collection
            .find_one(doc! { "_id": to_bson_id(id) })
            .await?
            .map(CodeLog::from)
            .ok_or_else(|| Error::not_found(format!("codelog {}", id)))
    }

    async fn list_run_logs(&self, scope: LogScope<'_>, limit: i64, page: i64) -> Result<Vec<CodeLog>> {
        let (start, end) = page_window(limit, page);
        let docs: Vec<CodeLogDocument> = self
            .collection
            .find(scope_filter(scope))
            .sort(doc! { "created_at": -1 })
            .skip(start as u64)
            .limit((end - start) as i64)
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(CodeLog::from).collect())
    }

    async fn count(&self, scope: LogScope<'_>) -> Result<i64> {
        let count = self.collection.count_documents(scope_filter(scope)).await?;
        Ok(count as i64)
    }

    async fn update(&self, id: &str, content: &str) -> Result<CodeLog> {
        let mut log = self.get_by_id(id).await?;
        log.content = content.to_string();
        log.updated_at = Utc::now();

        self.collection
            .update_one(
                doc! { "_id": to_bson_id(id) },
                doc! { "$set": {
                    "content": log.content.clone(),
                    "updated_at": to_bson_date(log.updated_at),
                } },
            )
            .await?;
        Ok(log)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = self.collection.delete_one(doc! { "_id": to_bson_id(id) }).await?;
        if result.deleted_count == 0 {
            return Err(Error::not_found(format!("codelog {}", id)));
        }
        Ok(())
    }

    async fn delete_older(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
        let raw = self.collection.clone_with_type::<Document>();
        let expired: Vec<Document> = raw
            .find(doc! { "created_at": { "$lt": to_bson_date(cutoff) } })
            .sort(doc! { "created_at": 1 })
            .limit(limit)
            .projection(doc! { "_id": 1 })
            .await?
            .try_collect()
            .await?;

        let ids: Vec<Bson> = expired.iter().filter_map(|d| d.get("_id").cloned()).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let result = raw.delete_many(doc! { "_id": { "$in": ids } }).await?;
        Ok(result.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_filter_only_sets_given_ids() {
        let filter = scope_filter(LogScope::new("run-1", "").unwrap());
        assert_eq!(filter.get_str("run_id").unwrap(), "run-1");
        assert!(!filter.contains_key("code_id"));

        let filter = scope_filter(LogScope::new("run-1", "code-1").unwrap());
        assert_eq!(filter.len(), 2);

        let run_oid = bson::oid::ObjectId::new();
        let filter = scope_filter(LogScope::new(&run_oid.to_hex(), "").unwrap());
        assert_eq!(filter.get_object_id("run_id").unwrap(), run_oid);
    }

    #[test]
    fn test_document_uses_type_field() {
        let mut log = CodeLog::new("run-1", "code-1", LogType::Error, "boom");
        log.id = new_object_id();
        let doc = bson::to_document(&CodeLogDocument::from(&log)).unwrap();
        assert_eq!(doc.get_str("type").unwrap(), "error");
        assert_eq!(doc.get_object_id("_id").unwrap().to_hex(), log.id);
    }

    #[test]
    fn test_reads_object_id_documents() {
        let (id, run_id, code_id) = (
            bson::oid::ObjectId::new(),
            bson::oid::ObjectId::new(),
            bson::oid::ObjectId::new(),
        );
        let stored = doc! {
            "_id": id,
            "run_id": run_id,
            "code_id": code_id,
            "type": "info",
            "content": "started",
            "created_at": bson::DateTime::now(),
            "updated_at": bson::DateTime::now(),
        };

        let log = CodeLog::from(bson::from_document::<CodeLogDocument>(stored).unwrap());
        assert_eq!(log.id, id.to_hex());
        assert_eq!(log.run_id, run_id.to_hex());
        assert_eq!(log.code_id, code_id.to_hex());
        assert_eq!(log.log_type, LogType::Info);
    }
}
