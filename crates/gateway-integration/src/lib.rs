//! # 接入集成模块
//!
//! 把传输层接入到持久化流水线：
//! - 来源处理器分发（文件上传、HL7v2文本、原始文本）
//! - 消息分组策略链
//! - 对象存储 + 有序队列的双写持久化
//! - HTTP / SOAP 接口和 MLLP 事务处理

pub mod api;
pub mod dispatch;
pub mod handlers;
pub mod message_group;
pub mod message_queue;
pub mod metadata;
pub mod mllp_service;
pub mod persistence;
pub mod processor;

pub use api::{create_api_routes, ApiServer, ApiState};
pub use dispatch::{IngestionRouter, InputKind, SourceHandler, SourceInput};
pub use handlers::default_handlers;
pub use message_group::{MessageGroupService, MessageGroupStrategy};
pub use message_queue::{AmqpQueue, InMemoryQueue, MessageQueue, MessageQueueConfig, QueueMessage};
pub use mllp_service::MllpIngestService;
pub use persistence::{IngestionPersistence, PersistenceTimeouts};
pub use processor::IngestionProcessor;
