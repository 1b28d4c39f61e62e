//! 双写持久化
//!
//! 顺序固定：数据对象 → 元数据对象 → （可选）确认对象 → 入队。
//! 只有对象全部写入成功后才会入队，消费者拿到指针时对象必然存在。
//! 入队失败时已写入的对象成为孤儿，事务按失败返回。

use crate::message_queue::{MessageQueue, QueueMessage};
use crate::metadata::{build_metadata_json, build_object_metadata};
use bytes::Bytes;
use gateway_core::{utils::non_blank, GatewayError, IngestionOutcome, RequestContext, Result};
use gateway_storage::{BlobStorage, Bucket};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// 各阶段的超时
#[derive(Debug, Clone, Copy)]
pub struct PersistenceTimeouts {
    pub blob_write: Duration,
    pub enqueue: Duration,
}

impl Default for PersistenceTimeouts {
    fn default() -> Self {
        Self {
            blob_write: Duration::from_secs(30),
            enqueue: Duration::from_secs(10),
        }
    }
}

/// 持久化服务，存储和队列句柄在所有事务间共享
#[derive(Clone)]
pub struct IngestionPersistence {
    storage: BlobStorage,
    queue: Arc<dyn MessageQueue>,
    timeouts: PersistenceTimeouts,
}

impl IngestionPersistence {
    pub fn new(storage: BlobStorage, queue: Arc<dyn MessageQueue>, timeouts: PersistenceTimeouts) -> Self {
        Self {
            storage,
            queue,
            timeouts,
        }
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.storage
    }

    /// 写入对象并入队
    pub async fn persist(
        &self,
        context: &RequestContext,
        payload: Bytes,
        content_type: &str,
        acknowledgement: Option<&str>,
    ) -> Result<IngestionOutcome> {
        let group_id = non_blank(context.message_group_id.as_deref()).ok_or_else(|| {
            GatewayError::Validation(format!(
                "Message group not assigned for interaction {}",
                context.interaction_id
            ))
        })?;
        let source = context.message_source_type;
        let mut outcome = IngestionOutcome::default();

        if source.should_write_to_blob() {
            outcome.blob_response = Some(
                self.write_objects(context, group_id, payload, content_type, acknowledgement)
                    .await?,
            );
        }

        if source.should_write_to_queue() {
            let message = QueueMessage::from_context(context, group_id, outcome.blob_response.clone());
            let message_id = with_timeout("enqueue", self.timeouts.enqueue, self.queue.enqueue(&message))
                .await
                .map_err(|e| {
                    error!(
                        interaction_id = %context.interaction_id,
                        group_key = %group_id,
                        "Enqueue failed after objects were written, orphaned object {}: {}",
                        context.full_data_path,
                        e
                    );
                    e
                })?;
            info!(
                interaction_id = %context.interaction_id,
                group_key = %group_id,
                "Enqueued message {} on {}",
                message_id,
                self.queue.name()
            );
            outcome.queue_message_id = Some(message_id);
        }

        Ok(outcome)
    }

    /// 用实际回写的确认覆盖已存储的确认对象
    ///
    /// 确认对象在入队前按肯定确认写入，事务随后失败时由调用方传入否定确认。
    /// 确认对象尚未写入时不做任何事，返回 `false`。
    pub async fn replace_acknowledgement(
        &self,
        context: &RequestContext,
        acknowledgement: &str,
    ) -> Result<bool> {
        let Some(key) = context.keys.acknowledgement_key.as_deref() else {
            return Ok(false);
        };
        if !self.storage.exists(Bucket::Data, key).await? {
            return Ok(false);
        }
        with_timeout(
            "blob_write",
            self.timeouts.blob_write,
            self.storage.put(
                Bucket::Data,
                key,
                Bytes::from(acknowledgement.to_string()),
                "text/plain",
            ),
        )
        .await?;
        info!(
            interaction_id = %context.interaction_id,
            "Replaced stored acknowledgement {}",
            key
        );
        Ok(true)
    }

    async fn write_objects(
        &self,
        context: &RequestContext,
        group_id: &str,
        payload: Bytes,
        content_type: &str,
        acknowledgement: Option<&str>,
    ) -> Result<String> {
        let metadata = build_metadata_json(context, group_id, &payload);
        let metadata = serde_json::to_vec_pretty(&metadata)?;

        let receipt = with_timeout(
            "blob_write",
            self.timeouts.blob_write,
            self.storage.put_with_metadata(
                Bucket::Data,
                &context.keys.data_key,
                payload,
                content_type,
                &build_object_metadata(context),
            ),
        )
        .await?;
        debug!(interaction_id = %context.interaction_id, "Data object written: {}", receipt);

        with_timeout(
            "blob_write",
            self.timeouts.blob_write,
            self.storage.put(
                Bucket::Metadata,
                &context.keys.metadata_key,
                Bytes::from(metadata),
                "application/json",
            ),
        )
        .await?;

        if let (Some(ack), Some(key)) = (acknowledgement, context.keys.acknowledgement_key.as_deref()) {
            with_timeout(
                "blob_write",
                self.timeouts.blob_write,
                self.storage
                    .put(Bucket::Data, key, Bytes::from(ack.to_string()), "text/plain"),
            )
            .await?;
        }

        info!(
            interaction_id = %context.interaction_id,
            "Stored objects {} and {}",
            context.full_data_path,
            context.full_metadata_path
        );
        Ok(receipt.to_string())
    }
}

async fn with_timeout<T>(
    stage: &str,
    limit: Duration,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => {
            error!("{} timed out after {:?}", stage, limit);
            Err(GatewayError::timeout(stage))
        }
    }
}
