//! S3-compatible object storage used by the code log store

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::S3Config;

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Minimal object store surface.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, metadata: HashMap<String, String>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
    /// Every object under `prefix`, following continuation tokens.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// S3/MinIO storage client
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "codeactions",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &config.endpoint {
            info!("Connecting to S3 at {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for StorageClient {
    async fn put(&self, key: &str, body: Vec<u8>, metadata: HashMap<String, String>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .set_metadata(Some(metadata))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", key))?;

        let data = response.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("Failed to list {}", prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete {}", key))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    use std::collections::BTreeMap;

    use tokio::sync::Mutex;

    use super::*;

    pub struct StoredObject {
        pub body: Vec<u8>,
        pub metadata: HashMap<String, String>,
        pub last_modified: DateTime<Utc>,
    }

    /// Object store over a sorted map, for tests.
    #[derive(Default)]
    pub struct MemoryObjectStore {
        pub objects: Mutex<BTreeMap<String, StoredObject>>,
    }

    impl MemoryObjectStore {
        pub async fn keys(&self) -> Vec<String> {
            self.objects.lock().await.keys().cloned().collect()
        }

        pub async fn set_last_modified(&self, key: &str, at: DateTime<Utc>) {
            if let Some(object) = self.objects.lock().await.get_mut(key) {
                object.last_modified = at;
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            metadata: HashMap<String, String>,
        ) -> Result<()> {
            self.objects.lock().await.insert(
                key.to_string(),
                StoredObject {
                    body,
                    metadata,
                    last_modified: Utc::now(),
                },
            );
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .await
                .get(key)
                .map(|o| o.body.clone())
                .with_context(|| format!("no such key: {}", key))
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
            Ok(self
                .objects
                .lock()
                .await
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, o)| ObjectInfo {
                    key: key.clone(),
                    last_modified: Some(o.last_modified),
                })
                .collect())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().await.remove(key);
            Ok(())
        }
    }
}
