//! 对象存储管理
//!
//! 数据桶与元数据桶各一个 `ObjectStore` 句柄，进程内长期共享、只读使用。

use bytes::Bytes;
use gateway_core::{GatewayError, Result};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    Memory,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub data_bucket: String,
    pub metadata_bucket: String,
    pub region: String,
    pub endpoint: Option<String>, // 兼容S3的私有部署，如MinIO/LocalStack
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::Memory,
            data_bucket: "ingestion-data".to_string(),
            metadata_bucket: "ingestion-metadata".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

/// 目标桶
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Data,
    Metadata,
}

/// 一次写入的回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReceipt {
    pub bucket: String,
    pub key: String,
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

impl fmt::Display for BlobReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)?;
        if let Some(e_tag) = &self.e_tag {
            write!(f, " etag={}", e_tag)?;
        }
        if let Some(version) = &self.version {
            write!(f, " version={}", version)?;
        }
        Ok(())
    }
}

/// Blob存储
#[derive(Clone)]
pub struct BlobStorage {
    data: Arc<dyn ObjectStore>,
    metadata: Arc<dyn ObjectStore>,
    data_bucket: String,
    metadata_bucket: String,
}

impl BlobStorage {
    /// 根据配置创建存储
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.provider {
            StorageProvider::Memory => {
                info!("Using in-memory blob storage");
                Ok(Self::in_memory(&config.data_bucket, &config.metadata_bucket))
            }
            StorageProvider::S3 => {
                let data = s3_store(config, &config.data_bucket)?;
                let metadata = s3_store(config, &config.metadata_bucket)?;
                info!(
                    "Connected to S3 buckets: data={}, metadata={}",
                    config.data_bucket, config.metadata_bucket
                );
                Ok(Self::with_stores(
                    data,
                    metadata,
                    &config.data_bucket,
                    &config.metadata_bucket,
                ))
            }
        }
    }

    /// 内存存储，用于开发和测试
    pub fn in_memory(data_bucket: &str, metadata_bucket: &str) -> Self {
        Self::with_stores(
            Arc::new(InMemory::new()),
            Arc::new(InMemory::new()),
            data_bucket,
            metadata_bucket,
        )
    }

    pub fn with_stores(
        data: Arc<dyn ObjectStore>,
        metadata: Arc<dyn ObjectStore>,
        data_bucket: &str,
        metadata_bucket: &str,
    ) -> Self {
        Self {
            data,
            metadata,
            data_bucket: data_bucket.to_string(),
            metadata_bucket: metadata_bucket.to_string(),
        }
    }

    pub fn bucket_name(&self, bucket: Bucket) -> &str {
        match bucket {
            Bucket::Data => &self.data_bucket,
            Bucket::Metadata => &self.metadata_bucket,
        }
    }

    fn store(&self, bucket: Bucket) -> &Arc<dyn ObjectStore> {
        match bucket {
            Bucket::Data => &self.data,
            Bucket::Metadata => &self.metadata,
        }
    }

    /// 写入对象并记录Content-Type
    pub async fn put(
        &self,
        bucket: Bucket,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<BlobReceipt> {
        self.put_with_metadata(bucket, key, body, content_type, &HashMap::new())
            .await
    }

    /// 写入对象，同时附带用户自定义元数据（S3 x-amz-meta-*）
    pub async fn put_with_metadata(
        &self,
        bucket: Bucket,
        key: &str,
        body: Bytes,
        content_type: &str,
        user_metadata: &HashMap<String, String>,
    ) -> Result<BlobReceipt> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        for (name, value) in user_metadata {
            attributes.insert(Attribute::Metadata(name.clone().into()), value.clone().into());
        }
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        let size = body.len();
        let result = self
            .store(bucket)
            .put_opts(&Path::from(key), PutPayload::from(body), options)
            .await
            .map_err(|e| GatewayError::Storage(format!("Failed to write {}: {}", key, e)))?;

        debug!(
            "Stored {} bytes at s3://{}/{}",
            size,
            self.bucket_name(bucket),
            key
        );
        Ok(BlobReceipt {
            bucket: self.bucket_name(bucket).to_string(),
            key: key.to_string(),
            e_tag: result.e_tag,
            version: result.version,
        })
    }

    /// 读取对象
    pub async fn get(&self, bucket: Bucket, key: &str) -> Result<Bytes> {
        let result = self
            .store(bucket)
            .get(&Path::from(key))
            .await
            .map_err(|e| GatewayError::Storage(format!("Failed to read {}: {}", key, e)))?;
        result
            .bytes()
            .await
            .map_err(|e| GatewayError::Storage(format!("Failed to read {}: {}", key, e)))
    }

    /// 对象是否存在
    pub async fn exists(&self, bucket: Bucket, key: &str) -> Result<bool> {
        match self.store(bucket).head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(GatewayError::Storage(format!(
                "Failed to stat {}: {}",
                key, e
            ))),
        }
    }
}

fn s3_store(config: &StorageConfig, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }
    let store = builder
        .build()
        .map_err(|e| GatewayError::Config(format!("Invalid S3 configuration for {}: {}", bucket, e)))?;
    Ok(Arc::new(store))
}
