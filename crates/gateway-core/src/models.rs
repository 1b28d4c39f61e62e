//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// 全局默认租户
pub const DEFAULT_TENANT_ID: &str = "default";

/// 没有任何分组策略匹配时使用的分组键
pub const DEFAULT_MESSAGE_GROUP_ID: &str = "default_message_group";

/// MSH字段缺失时的占位值
pub const UNKNOWN_FIELD: &str = "UNKNOWN";

/// 常用请求头名称
pub mod header_names {
    pub const TENANT_ID: &str = "X-Tenant-ID";
    pub const FORWARDED_FOR: &str = "X-Forwarded-For";
    pub const REAL_IP: &str = "X-Real-IP";
    pub const SERVER_IP: &str = "X-Server-IP";
    pub const SERVER_PORT: &str = "X-Server-Port";
    pub const FORWARDED_PORT: &str = "X-Forwarded-Port";
    pub const USER_AGENT: &str = "User-Agent";
    pub const SOURCE_ID: &str = "X-Source-Id";
    pub const MESSAGE_TYPE: &str = "X-Message-Type";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// 来源特定参数名称
pub mod parameter_names {
    pub const SOURCE_ID: &str = "sourceId";
    pub const MESSAGE_TYPE: &str = "msgType";
    pub const QE: &str = "QE";
    pub const FACILITY: &str = "facility";
    pub const MESSAGE_CODE: &str = "messageCode";
    pub const DELIVERY_TYPE: &str = "deliveryType";
}

/// 消息来源类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSourceType {
    HttpIngest, // multipart / 原始body上传
    HttpHold,   // 暂存路由
    Mllp,       // HL7v2 over MLLP
    SoapPix,    // IHE PIX (ITI-8)
    SoapPnr,    // IHE XDS.b PnR (ITI-41)
}

impl MessageSourceType {
    pub const ALL: [MessageSourceType; 5] = [
        MessageSourceType::HttpIngest,
        MessageSourceType::HttpHold,
        MessageSourceType::Mllp,
        MessageSourceType::SoapPix,
        MessageSourceType::SoapPnr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpIngest => "HTTP_INGEST",
            Self::HttpHold => "HTTP_HOLD",
            Self::Mllp => "MLLP",
            Self::SoapPix => "SOAP_PIX",
            Self::SoapPnr => "SOAP_PNR",
        }
    }

    /// 是否写入对象存储
    pub fn should_write_to_blob(&self) -> bool {
        match self {
            Self::HttpIngest | Self::HttpHold | Self::Mllp | Self::SoapPix | Self::SoapPnr => true,
        }
    }

    /// 是否写入消息队列
    pub fn should_write_to_queue(&self) -> bool {
        match self {
            Self::HttpIngest | Self::HttpHold | Self::Mllp | Self::SoapPix | Self::SoapPnr => true,
        }
    }

    /// HTTP来源不生成确认消息对象
    pub fn is_http(&self) -> bool {
        matches!(self, Self::HttpIngest | Self::HttpHold)
    }
}

impl fmt::Display for MessageSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PROXY协议地址族
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AddressFamily {
    Unspecified,
    Ipv4,
    Ipv6,
}

/// PROXY v2 头部解出的真实客户端地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyProtocolInfo {
    pub address_family: AddressFamily,
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl fmt::Display for ProxyProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {}:{} -> {}:{}",
            self.address_family,
            self.source_ip,
            self.source_port,
            self.destination_ip,
            self.destination_port
        )
    }
}

/// 按监听端口覆盖的路由与目录前缀
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortOverride {
    pub port: u16,
    pub route: Option<String>,
    pub data_dir: Option<String>,
    pub metadata_dir: Option<String>,
}

impl PortOverride {
    pub fn is_hold(&self) -> bool {
        self.route.as_deref() == Some("/hold")
    }
}

/// 对象存储键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectKeys {
    pub data_key: String,
    pub metadata_key: String,
    pub acknowledgement_key: Option<String>,
}

/// 单次入站事务的请求上下文
///
/// 由上下文构建器一次性生成，之后只读；唯一的后置字段是
/// `message_group_id`，由消息分组服务写入。持久化结果不放在这里，
/// 见 [`IngestionOutcome`]。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub headers: HashMap<String, String>,
    pub request_path: String,
    pub tenant_id: String,
    pub interaction_id: String,
    pub upload_time: DateTime<Utc>,
    pub timestamp: String, // epoch毫秒
    pub file_name: String,
    pub file_size: u64,
    pub keys: ObjectKeys,
    pub data_bucket: String,
    pub metadata_bucket: String,
    pub full_data_path: String,
    pub full_metadata_path: String,
    pub full_acknowledgement_path: Option<String>,
    pub user_agent: String,
    pub full_request_url: String,
    pub query_params: Option<String>,
    pub protocol: String,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub source_ip: Option<String>,
    pub destination_ip: Option<String>,
    pub destination_port: Option<String>,
    pub message_source_type: MessageSourceType,
    pub message_group_id: Option<String>,
    pub additional_parameters: HashMap<String, String>,
    pub ingestion_api_version: String,
}

impl RequestContext {
    /// 读取来源特定参数，空白值视为缺失
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.additional_parameters
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// 按名称（不区分大小写）读取请求头
    pub fn header(&self, name: &str) -> Option<&str> {
        crate::utils::find_header(&self.headers, name)
    }
}

/// 持久化完成后产生的结果，与请求上下文分开保存
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionOutcome {
    pub blob_response: Option<String>,
    pub queue_message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_write_flags() {
        for source in MessageSourceType::ALL {
            assert!(source.should_write_to_blob());
            assert!(source.should_write_to_queue());
        }
        assert!(MessageSourceType::HttpHold.is_http());
        assert!(!MessageSourceType::SoapPnr.is_http());
    }

    #[test]
    fn test_source_type_serialization() {
        let json = serde_json::to_string(&MessageSourceType::SoapPix).unwrap();
        assert_eq!(json, "\"SOAP_PIX\"");
        assert_eq!(MessageSourceType::HttpIngest.to_string(), "HTTP_INGEST");
    }

    #[test]
    fn test_port_override_hold_route() {
        let hold = PortOverride {
            port: 9090,
            route: Some("/hold".to_string()),
            ..Default::default()
        };
        assert!(hold.is_hold());
        assert!(!PortOverride::default().is_hold());
    }
}
