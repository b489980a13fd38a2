use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CodeRun, CodeRunRepository, CodeRunStatus, RunFilter};
use crate::db::{from_bson_date, from_bson_id, to_bson_date, to_bson_id};
use crate::error::{Error, Result};
use crate::ids::{new_object_id, RecordId};

/// Stored shape of a run; `_id` and `code_id` are BSON object ids.
#[derive(Debug, Serialize, Deserialize)]
struct CodeRunDocument {
    #[serde(rename = "_id")]
    id: Bson,
    code_id: Bson,
    status: CodeRunStatus,
    #[serde(default)]
    result: String,
    #[serde(default)]
    extra: Map<String, Value>,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    headers: Map<String, Value>,
    created_at: bson::DateTime,
    updated_at: bson::DateTime,
}

impl From<&CodeRun> for CodeRunDocument {
    fn from(run: &CodeRun) -> Self {
        Self {
            id: to_bson_id(&run.id),
            code_id: to_bson_id(&run.code_id),
            status: run.status,
            result: run.result.clone(),
            extra: run.extra.clone(),
            params: run.params.clone(),
            body: run.body.clone(),
            headers: run.headers.clone(),
            created_at: to_bson_date(run.created_at),
            updated_at: to_bson_date(run.updated_at),
        }
    }
}

impl From<CodeRunDocument> for CodeRun {
    fn from(doc: CodeRunDocument) -> Self {
        Self {
            id: from_bson_id(doc.id),
            code_id: from_bson_id(doc.code_id),
            status: doc.status,
            result: doc.result,
            extra: doc.extra,
            params: doc.params,
            body: doc.body,
            headers: doc.headers,
            created_at: from_bson_date(doc.created_at),
            updated_at: from_bson_date(doc.updated_at),
        }
    }
}

pub struct MongoCodeRunRepository {
    collection: Collection<CodeRunDocument>,
}

impl MongoCodeRunRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("coderun"),
        }
    }
}

fn id_filter(id: &str) -> Result<Document> {
    Ok(doc! { "_id": to_bson_id(&RecordId::parse(id)?.to_string()) })
}

fn created_range(filter: RunFilter) -> Option<Document> {
    let mut range = Document::new();
    if let Some(after) = filter.after {
        range.insert("$gte", to_bson_date(after));
    }
    if let Some(before) = filter.before {
        range.insert("$lte", to_bson_date(before));
    }
    (!range.is_empty()).then_some(range)
}

#[async_trait]
impl CodeRunRepository for MongoCodeRunRepository {
    async fn create(&self, mut run: CodeRun) -> Result<CodeRun> {
        if run.id.is_empty() {
            run.id = new_object_id();
        }
        self.collection
            .insert_one(CodeRunDocument::from(&run))
            .await?;
        Ok(run)
    }

    async fn get_by_id(&self, id: &str) -> Result<CodeRun> {
        self.collection
            .find_one(id_filter(id)?)
            .await?
            .map(CodeRun::from)
            .ok_or_else(|| Error::not_found(format!("coderun {}", id)))
    }

    async fn list_by_code_id(&self, code_id: &str, filter: RunFilter) -> Result<Vec<CodeRun>> {
        let mut query = doc! { "code_id": to_bson_id(code_id) };
        if let Some(range) = created_range(filter) {
            query.insert("created_at", range);
        }

        let docs: Vec<CodeRunDocument> = self
            .collection
            .find(query)
            .sort(doc! { "created_at": -1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(CodeRun::from).collect())
    }

    async fn update(&self, run: &CodeRun) -> Result<CodeRun> {
        let result = self
            .collection
            .replace_one(id_filter(&run.id)?, CodeRunDocument::from(run))
            .await?;
        if result.matched_count == 0 {
            return Err(Error::not_found(format!("coderun {}", run.id)));
        }
        Ok(run.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let result = self.collection.delete_one(id_filter(id)?).await?;
        if result.deleted_count == 0 {
            return Err(Error::not_found(format!("coderun {}", id)));
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
    use serde_json::json;

    #[test]
    fn test_document_round_trip_keeps_fields() {
        let mut run = CodeRun::new("code-1");
        run.id = new_object_id();
        run.params.insert("q".into(), json!("1"));
        run.extra.insert("status_code".into(), json!(200));

        let back = CodeRun::from(CodeRunDocument::from(&run));
        assert_eq!(back.id, run.id);
        assert_eq!(back.params, run.params);
        assert_eq!(back.extra, run.extra);
        assert_eq!(back.created_at.timestamp_millis(), run.created_at.timestamp_millis());
    }

    #[test]
    fn test_document_serializes_status_lowercase() {
        let mut run = CodeRun::new("code-1");
        run.id = new_object_id();
        let doc = bson::to_document(&CodeRunDocument::from(&run)).unwrap();
        assert_eq!(doc.get_str("status").unwrap(), "queued");
        assert_eq!(doc.get_object_id("_id").unwrap().to_hex(), run.id);
        // a non object id code reference is kept as written
        assert_eq!(doc.get_str("code_id").unwrap(), "code-1");
    }

    #[test]
    fn test_reads_object_id_documents() {
        let oid = bson::oid::ObjectId::new();
        let code_oid = bson::oid::ObjectId::new();
        let stored = doc! {
            "_id": oid,
            "code_id": code_oid,
            "status": "completed",
            "result": "ok",
            "created_at": bson::DateTime::now(),
            "updated_at": bson::DateTime::now(),
        };

        let run = CodeRun::from(bson::from_document::<CodeRunDocument>(stored).unwrap());
        assert_eq!(run.id, oid.to_hex());
        assert_eq!(run.code_id, code_oid.to_hex());
        assert_eq!(run.status, CodeRunStatus::Completed);

        let filter = id_filter(&run.id).unwrap();
        assert_eq!(filter.get_object_id("_id").unwrap(), oid);
    }

    #[test]
    fn test_created_range() {
        assert!(created_range(RunFilter::default()).is_none());
        let now = Utc::now();
        let range = created_range(RunFilter {
            after: Some(now),
            before: None,
        })
        .unwrap();
        assert!(range.contains_key("$gte"));
        assert!(!range.contains_key("$lte"));
    }

    #[test]
    fn test_id_filter_rejects_garbage() {
        assert!(id_filter("not-an-id").is_err());
        let filter = id_filter("65A1F0C2E4B0A1B2C3D4E5F6").unwrap();
        assert_eq!(
            filter.get_object_id("_id").unwrap().to_hex(),
            "65a1f0c2e4b0a1b2c3d4e5f6"
        );
    }
}
