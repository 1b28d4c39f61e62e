//! 错误定义模块

use thiserror::Error;

/// 网关统一错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("帧格式错误: {0}")]
    Framing(String),

    #[error("HL7消息错误: {0}")]
    Hl7(String),

    #[error("SOAP消息错误: {0}")]
    Soap(String),

    #[error("处理器分发错误: {0}")]
    Dispatch(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("消息队列错误: {0}")]
    Queue(String),

    #[error("操作超时: {stage}")]
    Timeout { stage: String },

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl GatewayError {
    /// 构造指定阶段的超时错误
    pub fn timeout(stage: &str) -> Self {
        GatewayError::Timeout {
            stage: stage.to_string(),
        }
    }

    /// 是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. })
    }
}

/// 网关统一结果类型
pub type Result<T> = std::result::Result<T, GatewayError>;
