//! 消息队列集成模块
//!
//! 每个事务一条指针消息，引用数据对象和元数据对象。消息的路由键和
//! `x-message-group-id` 头都是分组键，同一分组的消息进入同一个分区队列，
//! 由单个消费者按入队顺序处理。

use async_trait::async_trait;
use gateway_core::{GatewayError, RequestContext, Result};
use lapin::{
    options::*, publisher_confirm::Confirmation, types::AMQPValue, types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub const GROUP_ID_HEADER: &str = "x-message-group-id";
pub const CONSISTENT_HASH_EXCHANGE: &str = "x-consistent-hash";

/// 消息队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueueConfig {
    pub url: String,
    pub exchange: String,
    pub exchange_kind: String,
    pub heartbeat: u16,
    pub prefetch_count: u16,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            exchange: "ingestion".to_string(),
            exchange_kind: CONSISTENT_HASH_EXCHANGE.to_string(),
            heartbeat: 60,
            prefetch_count: 10,
        }
    }
}

impl MessageQueueConfig {
    // lapin 通过URI参数协商心跳
    fn connection_url(&self) -> String {
        if self.url.contains("heartbeat=") {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}heartbeat={}", self.url, separator, self.heartbeat)
    }

    fn kind(&self) -> ExchangeKind {
        match self.exchange_kind.as_str() {
            "direct" => ExchangeKind::Direct,
            "topic" => ExchangeKind::Topic,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }
}

/// 入队的指针消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub tenant_id: String,
    pub interaction_id: String,
    pub request_url: String,
    pub timestamp: String,
    pub file_name: String,
    pub file_size: u64,
    pub s3_data_object_path: String,
    pub full_s3_meta_data_path: String,
    pub message_group_id: String,
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_s3_acknowledgement_path: Option<String>,
}

impl QueueMessage {
    /// 由已分组的上下文生成指针消息
    pub fn from_context(
        context: &RequestContext,
        group_id: &str,
        s3_response: Option<String>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: context.tenant_id.clone(),
            interaction_id: context.interaction_id.clone(),
            request_url: context.full_request_url.clone(),
            timestamp: context.timestamp.clone(),
            file_name: context.file_name.clone(),
            file_size: context.file_size,
            s3_data_object_path: context.full_data_path.clone(),
            full_s3_meta_data_path: context.full_metadata_path.clone(),
            message_group_id: group_id.to_string(),
            source_type: context.message_source_type.as_str().to_string(),
            s3_response,
            full_s3_acknowledgement_path: context.full_acknowledgement_path.clone(),
        }
    }
}

/// 有序队列接口
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 入队，返回队列消息id
    async fn enqueue(&self, message: &QueueMessage) -> Result<String>;

    /// 获取队列实现名称
    fn name(&self) -> &str;
}

/// AMQP消息发布器
pub struct AmqpQueue {
    channel: RwLock<Option<Channel>>,
    config: MessageQueueConfig,
}

impl AmqpQueue {
    /// 创建新的消息发布器
    pub fn new(config: MessageQueueConfig) -> Self {
        Self {
            channel: RwLock::new(None),
            config,
        }
    }

    /// 连接到消息队列，开启发布确认并声明交换器
    pub async fn connect(&self) -> Result<()> {
        let conn = Connection::connect(&self.config.connection_url(), ConnectionProperties::default())
            .await
            .map_err(queue_error)?;
        let channel = conn.create_channel().await.map_err(queue_error)?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(queue_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(queue_error)?;
        channel
            .exchange_declare(
                &self.config.exchange,
                self.config.kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(queue_error)?;

        let mut channel_lock = self.channel.write().await;
        *channel_lock = Some(channel);

        info!(
            "Connected to message queue: {} (exchange {})",
            self.config.url, self.config.exchange
        );
        Ok(())
    }

    /// 断开连接
    pub async fn disconnect(&self) -> Result<()> {
        let mut channel_lock = self.channel.write().await;
        if let Some(channel) = channel_lock.take() {
            channel.close(200, "shutdown").await.map_err(queue_error)?;
        }
        info!("Disconnected from message queue");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for AmqpQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<String> {
        let channel_lock = self.channel.read().await;
        let channel = channel_lock
            .as_ref()
            .ok_or_else(|| GatewayError::Queue("Not connected to message queue".to_string()))?;

        let payload = serde_json::to_vec(message)?;
        let mut headers = FieldTable::default();
        headers.insert(
            GROUP_ID_HEADER.into(),
            AMQPValue::LongString(message.message_group_id.clone().into()),
        );
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(message.message_id.clone().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64)
            .with_delivery_mode(2)
            .with_headers(headers);

        // mandatory: 没有队列绑定该分组键时，代理退回消息而不是静默丢弃
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                &message.message_group_id,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &payload,
                properties,
            )
            .await
            .map_err(queue_error)?
            .await
            .map_err(queue_error)?;

        PublishOutcome::from(confirm).settle(&message.message_id)
    }

    fn name(&self) -> &str {
        "amqp"
    }
}

/// 发布确认的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Acked,
    /// 无法路由，代理退回
    Returned { reply_code: u16, reply_text: String },
    Nacked,
    Unconfirmed,
}

impl From<Confirmation> for PublishOutcome {
    fn from(confirm: Confirmation) -> Self {
        match confirm {
            Confirmation::Ack(None) => PublishOutcome::Acked,
            Confirmation::Ack(Some(returned)) => PublishOutcome::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.as_str().to_string(),
            },
            Confirmation::Nack(_) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::Unconfirmed,
        }
    }
}

impl PublishOutcome {
    /// 只有被确认且未被退回的消息才算入队
    pub fn settle(self, message_id: &str) -> Result<String> {
        match self {
            PublishOutcome::Acked => {
                debug!("Message published successfully: {}", message_id);
                Ok(message_id.to_string())
            }
            PublishOutcome::Returned {
                reply_code,
                reply_text,
            } => {
                error!(
                    "Message {} returned by broker: {} {}",
                    message_id, reply_code, reply_text
                );
                Err(GatewayError::Queue(format!(
                    "Message {} is unroutable: {} {}",
                    message_id, reply_code, reply_text
                )))
            }
            PublishOutcome::Nacked => {
                error!("Message publish rejected: {}", message_id);
                Err(GatewayError::Queue(format!(
                    "Message {} rejected by broker",
                    message_id
                )))
            }
            PublishOutcome::Unconfirmed => {
                warn!("Publisher confirm missing for {}", message_id);
                Err(GatewayError::Queue(format!(
                    "Message {} was not confirmed by broker",
                    message_id
                )))
            }
        }
    }
}

fn queue_error(e: lapin::Error) -> GatewayError {
    GatewayError::Queue(e.to_string())
}

/// 进程内队列，开发模式和测试使用
#[derive(Default)]
pub struct InMemoryQueue {
    messages: Mutex<Vec<QueueMessage>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已入队消息的快照
    pub fn messages(&self) -> Vec<QueueMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// 某个分组内的消息，按入队顺序
    pub fn group(&self, group_id: &str) -> Vec<QueueMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.message_group_id == group_id)
            .collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<String> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| GatewayError::Internal("Queue lock poisoned".to_string()))?;
        messages.push(message.clone());
        debug!(
            "Enqueued message {} in group {}",
            message.message_id, message.message_group_id
        );
        Ok(message.message_id.clone())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
