//! 请求上下文构建
//!
//! 将三种入口（HTTP、MLLP、SOAP）的原始传输信息统一组装为 [`RequestContext`]。
//! 构建过程是纯函数：不访问网络和存储，也不会失败。

use crate::models::{
    header_names, parameter_names, MessageSourceType, ObjectKeys, PortOverride,
    ProxyProtocolInfo, RequestContext, DEFAULT_TENANT_ID,
};
use crate::utils::{
    date_partition, find_header, full_object_path, generate_interaction_id, non_blank,
    with_prefix,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

/// 上下文构建器的静态配置
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub data_bucket: String,
    pub metadata_bucket: String,
    pub default_tenant: String,
    pub source_tenants: HashMap<MessageSourceType, String>,
    pub port_overrides: Vec<PortOverride>,
    pub ingestion_api_version: String,
    pub default_user_agent: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            data_bucket: "ingestion-data".to_string(),
            metadata_bucket: "ingestion-metadata".to_string(),
            default_tenant: DEFAULT_TENANT_ID.to_string(),
            source_tenants: HashMap::new(),
            port_overrides: Vec::new(),
            ingestion_api_version: env!("CARGO_PKG_VERSION").to_string(),
            default_user_agent: "Unknown".to_string(),
        }
    }
}

/// 单次事务的原始传输输入
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub source_type: MessageSourceType,
    pub headers: HashMap<String, String>,
    pub request_path: String,
    pub full_request_url: String,
    pub query_params: Option<String>,
    pub protocol: String,
    pub file_name: String,
    pub file_size: u64,
    pub interaction_id: Option<String>,
    pub user_agent: Option<String>,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub proxy: Option<ProxyProtocolInfo>,
    pub additional_parameters: HashMap<String, String>,
}

impl ContextRequest {
    pub fn new(source_type: MessageSourceType, request_path: &str) -> Self {
        Self {
            source_type,
            headers: HashMap::new(),
            request_path: request_path.to_string(),
            full_request_url: request_path.to_string(),
            query_params: None,
            protocol: "HTTP/1.1".to_string(),
            file_name: String::new(),
            file_size: 0,
            interaction_id: None,
            user_agent: None,
            local_address: None,
            remote_address: None,
            proxy: None,
            additional_parameters: HashMap::new(),
        }
    }
}

/// 请求上下文构建器
#[derive(Debug, Clone)]
pub struct RequestContextBuilder {
    settings: ContextSettings,
}

impl RequestContextBuilder {
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// 按当前时间构建上下文
    pub fn build(&self, request: ContextRequest) -> RequestContext {
        self.build_at(request, Utc::now())
    }

    /// 按指定到达时间构建上下文
    pub fn build_at(&self, request: ContextRequest, now: DateTime<Utc>) -> RequestContext {
        let interaction_id = non_blank(request.interaction_id.as_deref())
            .map(str::to_string)
            .unwrap_or_else(generate_interaction_id);

        let tenant_id = self.resolve_tenant(&request);
        let source_ip = resolve_source_ip(&request);
        let (destination_ip, destination_port) = resolve_destination(&request);

        let port_override = destination_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
            .and_then(|port| self.settings.port_overrides.iter().find(|o| o.port == port));

        let source_type = match (request.source_type, port_override) {
            (MessageSourceType::HttpIngest, Some(o)) if o.is_hold() => MessageSourceType::HttpHold,
            (source, _) => source,
        };

        let user_agent = non_blank(request.user_agent.as_deref())
            .or_else(|| find_header(&request.headers, header_names::USER_AGENT))
            .unwrap_or(self.settings.default_user_agent.as_str())
            .to_string();

        let timestamp = now.timestamp_millis().to_string();
        let keys = object_keys(
            &interaction_id,
            &timestamp,
            &now,
            port_override,
            !source_type.is_http(),
        );

        let mut additional_parameters = request.additional_parameters.clone();
        if source_type.is_http() {
            copy_header_parameter(
                &request.headers,
                header_names::SOURCE_ID,
                parameter_names::SOURCE_ID,
                &mut additional_parameters,
            );
            copy_header_parameter(
                &request.headers,
                header_names::MESSAGE_TYPE,
                parameter_names::MESSAGE_TYPE,
                &mut additional_parameters,
            );
        }

        debug!(
            interaction_id = %interaction_id,
            tenant_id = %tenant_id,
            source = %source_type,
            "Built request context"
        );

        RequestContext {
            full_data_path: full_object_path(&self.settings.data_bucket, &keys.data_key),
            full_metadata_path: full_object_path(&self.settings.metadata_bucket, &keys.metadata_key),
            full_acknowledgement_path: keys
                .acknowledgement_key
                .as_deref()
                .map(|k| full_object_path(&self.settings.data_bucket, k)),
            keys,
            headers: request.headers,
            request_path: request.request_path,
            tenant_id,
            interaction_id,
            upload_time: now,
            timestamp,
            file_name: request.file_name,
            file_size: request.file_size,
            data_bucket: self.settings.data_bucket.clone(),
            metadata_bucket: self.settings.metadata_bucket.clone(),
            user_agent,
            full_request_url: request.full_request_url,
            query_params: request.query_params,
            protocol: request.protocol,
            local_address: request.local_address.map(|a| a.to_string()),
            remote_address: request.remote_address.map(|a| a.to_string()),
            source_ip,
            destination_ip,
            destination_port,
            message_source_type: source_type,
            message_group_id: None,
            additional_parameters,
            ingestion_api_version: self.settings.ingestion_api_version.clone(),
        }
    }

    // 租户: 请求头 -> 来源默认 -> 全局默认
    fn resolve_tenant(&self, request: &ContextRequest) -> String {
        find_header(&request.headers, header_names::TENANT_ID)
            .or_else(|| {
                non_blank(
                    self.settings
                        .source_tenants
                        .get(&request.source_type)
                        .map(String::as_str),
                )
            })
            .or_else(|| non_blank(Some(self.settings.default_tenant.as_str())))
            .unwrap_or(DEFAULT_TENANT_ID)
            .to_string()
    }
}

fn resolve_source_ip(request: &ContextRequest) -> Option<String> {
    if let Some(proxy) = &request.proxy {
        return Some(proxy.source_ip.to_string());
    }
    if let Some(forwarded) = find_header(&request.headers, header_names::FORWARDED_FOR) {
        if let Some(first) = non_blank(forwarded.split(',').next()) {
            return Some(first.to_string());
        }
    }
    find_header(&request.headers, header_names::REAL_IP)
        .map(str::to_string)
        .or_else(|| request.remote_address.map(|a| a.ip().to_string()))
}

fn resolve_destination(request: &ContextRequest) -> (Option<String>, Option<String>) {
    if let Some(proxy) = &request.proxy {
        return (
            Some(proxy.destination_ip.to_string()),
            Some(proxy.destination_port.to_string()),
        );
    }
    let ip = find_header(&request.headers, header_names::SERVER_IP)
        .map(str::to_string)
        .or_else(|| request.local_address.map(|a| a.ip().to_string()));
    let port = find_header(&request.headers, header_names::SERVER_PORT)
        .or_else(|| find_header(&request.headers, header_names::FORWARDED_PORT))
        .map(str::to_string)
        .or_else(|| request.local_address.map(|a| a.port().to_string()));
    (ip, port)
}

fn copy_header_parameter(
    headers: &HashMap<String, String>,
    header: &str,
    parameter: &str,
    parameters: &mut HashMap<String, String>,
) {
    if parameters.contains_key(parameter) {
        return;
    }
    if let Some(value) = find_header(headers, header) {
        parameters.insert(parameter.to_string(), value.to_string());
    }
}

/// 计算数据、元数据以及确认消息的对象键
pub fn object_keys(
    interaction_id: &str,
    timestamp: &str,
    time: &DateTime<Utc>,
    port_override: Option<&PortOverride>,
    with_acknowledgement: bool,
) -> ObjectKeys {
    let date = date_partition(time);
    let data_dir = port_override.and_then(|o| o.data_dir.as_deref());
    let metadata_dir = port_override.and_then(|o| o.metadata_dir.as_deref());

    let data_key = with_prefix(
        data_dir,
        &format!("data/{}/{}_{}", date, interaction_id, timestamp),
    );
    let metadata_key = with_prefix(
        metadata_dir,
        &format!("metadata/{}/{}_{}_metadata.json", date, interaction_id, timestamp),
    );
    let acknowledgement_key = with_acknowledgement.then(|| format!("{}_ack", data_key));

    ObjectKeys {
        data_key,
        metadata_key,
        acknowledgement_key,
    }
}
