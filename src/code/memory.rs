use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Code, CodeRepository, CodeType};
use crate::error::{Error, Result};
use crate::ids::{new_object_id, RecordId};

#[derive(Default)]
pub struct MemoryCodeRepository {
    codes: RwLock<HashMap<String, Code>>,
}

impl MemoryCodeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeRepository for MemoryCodeRepository {
    async fn create(&self, mut code: Code) -> Result<Code> {
        if code.id.is_empty() {
            code.id = new_object_id();
        }
        self.codes.write().await.insert(code.id.clone(), code.clone());
        Ok(code)
    }

    async fn get_by_id(&self, id: &str) -> Result<Code> {
        let key = RecordId::parse(id)?.to_string();
        self.codes
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("code {}", id)))
    }

    async fn list_by_project(&self, project_uuid: &str, code_type: Option<CodeType>) -> Result<Vec<Code>> {
        let mut codes: Vec<Code> = self
            .codes
            .read()
            .await
            .values()
            .filter(|c| c.project_uuid == project_uuid)
            .filter(|c| code_type.map_or(true, |t| c.code_type == t))
            .cloned()
            .collect();
        codes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(codes)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let key = RecordId::parse(id)?.to_string();
        self.codes
            .write()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("code {}", id)))
    }
}
