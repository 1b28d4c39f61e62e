//! 入站处理流水线
//!
//! 上下文构建 → 消息分组 → 双写持久化。三种入口共用同一条流水线，
//! 每个事务在自己的任务里执行，不共享可变状态。

use crate::message_group::MessageGroupService;
use crate::persistence::IngestionPersistence;
use bytes::Bytes;
use gateway_core::{
    ContextRequest, IngestionOutcome, RequestContext, RequestContextBuilder, Result,
};
use std::collections::HashMap;
use tracing::{info, Instrument};

pub const STATUS_SUCCESS: &str = "Success";

/// 入站处理器
#[derive(Clone)]
pub struct IngestionProcessor {
    builder: RequestContextBuilder,
    groups: MessageGroupService,
    persistence: IngestionPersistence,
}

impl IngestionProcessor {
    pub fn new(
        builder: RequestContextBuilder,
        groups: MessageGroupService,
        persistence: IngestionPersistence,
    ) -> Self {
        Self {
            builder,
            groups,
            persistence,
        }
    }

    pub fn ingestion_api_version(&self) -> &str {
        &self.builder.settings().ingestion_api_version
    }

    pub fn persistence(&self) -> &IngestionPersistence {
        &self.persistence
    }

    /// 构建请求上下文
    pub fn build_context(&self, request: ContextRequest) -> RequestContext {
        self.builder.build(request)
    }

    /// 分组并持久化，返回结果摘要
    pub async fn ingest(
        &self,
        context: &mut RequestContext,
        payload: Bytes,
        content_type: &str,
        acknowledgement: Option<&str>,
    ) -> Result<HashMap<String, String>> {
        let span = tracing::info_span!(
            "ingest",
            interaction_id = %context.interaction_id,
            source = %context.message_source_type
        );
        async {
            let group_id = self.groups.assign(context);
            let outcome = self
                .persistence
                .persist(context, payload, content_type, acknowledgement)
                .await?;
            info!(
                group_key = %group_id,
                "Ingested {} ({} bytes)",
                context.file_name,
                context.file_size
            );
            Ok(response_map(context, &outcome))
        }
        .instrument(span)
        .await
    }
}

/// 成功结果摘要，作为确认消息和HTTP响应的基础
pub fn response_map(context: &RequestContext, outcome: &IngestionOutcome) -> HashMap<String, String> {
    let mut result = HashMap::new();
    result.insert(
        "messageId".to_string(),
        outcome
            .queue_message_id
            .clone()
            .unwrap_or_else(|| context.interaction_id.clone()),
    );
    result.insert("interactionId".to_string(), context.interaction_id.clone());
    result.insert(
        "ingestionApiVersion".to_string(),
        context.ingestion_api_version.clone(),
    );
    result.insert("fullS3Path".to_string(), context.full_data_path.clone());
    result.insert(
        "fullS3MetaDataPath".to_string(),
        context.full_metadata_path.clone(),
    );
    result.insert("timestamp".to_string(), context.timestamp.clone());
    if let Some(path) = &context.full_acknowledgement_path {
        result.insert("fullS3AcknowledgementPath".to_string(), path.clone());
    }
    if let Some(group_id) = &context.message_group_id {
        result.insert("messageGroupId".to_string(), group_id.clone());
    }
    result.insert("status".to_string(), STATUS_SUCCESS.to_string());
    result
}
