use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use super::{Code, CodeRepository, CodeType, Language, DEFAULT_TIMEOUT_SECS};
use crate::db::{from_bson_date, from_bson_id, to_bson_date, to_bson_id};
use crate::error::{Error, Result};
use crate::ids::{new_object_id, RecordId};

#[derive(Debug, Serialize, Deserialize)]
struct CodeDocument {
    #[serde(rename = "_id")]
    id: Bson,
    name: String,
    #[serde(rename = "type")]
    code_type: CodeType,
    source: String,
    language: Language,
    #[serde(default)]
    url: String,
    project_uuid: String,
    #[serde(default)]
    timeout: i64,
    created_at: bson::DateTime,
    updated_at: bson::DateTime,
}

impl From<&Code> for CodeDocument {
    fn from(code: &Code) -> Self {
        Self {
            id: to_bson_id(&code.id),
            name: code.name.clone(),
            code_type: code.code_type,
            source: code.source.clone(),
            language: code.language,
            url: code.url.clone(),
            project_uuid: code.project_uuid.clone(),
            timeout: code.timeout,
            created_at: to_bson_date(code.created_at),
            updated_at: to_bson_date(code.updated_at),
        }
    }
}

impl From<CodeDocument> for Code {
    fn from(doc: CodeDocument) -> Self {
        Self {
            id: from_bson_id(doc.id),
            name: doc.name,
            code_type: doc.code_type,
            source: doc.source,
            language: doc.language,
            url: doc.url,
            project_uuid: doc.project_uuid,
            timeout: if doc.timeout == 0 {
                DEFAULT_TIMEOUT_SECS
            } else {
                doc.timeout
            },
            created_at: from_bson_date(doc.created_at),
            updated_at: from_bson_date(doc.updated_at),
        }
    }
}

pub struct MongoCodeRepository {
    collection: Collection<CodeDocument>,
}

impl MongoCodeRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("code"),
        }
    }
}

#[async_trait]
impl CodeRepository for MongoCodeRepository {
    async fn create(&self, mut code: Code) -> Result<Code> {
        if code.id.is_empty() {
            code.id = new_object_id();
        }
        self.collection.insert_one(CodeDocument::from(&code)).await?;
        Ok(code)
    }

    async fn get_by_id(&self, id: &str) -> Result<Code> {
        let key = to_bson_id(&RecordId::parse(id)?.to_string());
        self.collection
            .find_one(doc! { "_id": key })
            .await?
            .map(Code::from)
            .ok_or_else(|| Error::not_found(format!("code {}", id)))
    }

    async fn list_by_project(&self, project_uuid: &str, code_type: Option<CodeType>) -> Result<Vec<Code>> {
        let mut filter = doc! { "project_uuid": project_uuid };
        if let Some(code_type) = code_type {
            filter.insert("type", code_type.as_str());
        }

        let docs: Vec<CodeDocument> = self
            .collection
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Code::from).collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let key = to_bson_id(&RecordId::parse(id)?.to_string());
        let result = self.collection.delete_one(doc! { "_id": key }).await?;
        if result.deleted_count == 0 {
            return Err(Error::not_found(format!("code {}", id)));
        }
        Ok(())
    }
}
