//! 元数据构建

use gateway_core::RequestContext;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// 元数据对象（写入元数据桶的JSON）
pub fn build_metadata_json(context: &RequestContext, group_id: &str, payload: &[u8]) -> Value {
    let headers: Vec<Value> = {
        let mut names: Vec<&String> = context.headers.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| json!({ name.as_str(): context.headers[name] }))
            .collect()
    };

    json!({
        "key": context.keys.data_key,
        "json_metadata": {
            "tenantId": context.tenant_id,
            "interactionId": context.interaction_id,
            "uploadDate": context.upload_time.format("%Y-%m-%d").to_string(),
            "uploadTime": context.upload_time.to_rfc3339(),
            "timestamp": context.timestamp,
            "fileName": context.file_name,
            "fileSize": context.file_size.to_string(),
            "sha256": sha256_hex(payload),
            "sourceType": context.message_source_type.as_str(),
            "messageGroupId": group_id,
            "s3ObjectPath": context.full_data_path,
            "s3MetadataPath": context.full_metadata_path,
            "s3AcknowledgementPath": context.full_acknowledgement_path,
            "requestUrl": context.request_path,
            "fullRequestUrl": context.full_request_url,
            "queryParams": context.query_params,
            "protocol": context.protocol,
            "userAgent": context.user_agent,
            "localAddress": context.local_address,
            "remoteAddress": context.remote_address,
            "sourceIp": context.source_ip,
            "destinationIp": context.destination_ip,
            "destinationPort": context.destination_port,
            "ingestionApiVersion": context.ingestion_api_version,
            "additionalParameters": context.additional_parameters,
            "headers": headers,
        }
    })
}

// 控制字符、非ASCII和 `%` 本身都要编码
const METADATA_VALUE: &AsciiSet = &CONTROLS.add(b'%');

/// 数据对象上附带的S3用户元数据
///
/// 值会成为 `x-amz-meta-*` 请求头，调用方提供的文件名和User-Agent按百分号编码。
pub fn build_object_metadata(context: &RequestContext) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    let mut insert = |name: &str, value: &str| {
        metadata.insert(
            name.to_string(),
            utf8_percent_encode(value, METADATA_VALUE).to_string(),
        );
    };
    insert("interactionId", &context.interaction_id);
    insert("tenantId", &context.tenant_id);
    insert("fileName", &context.file_name);
    insert("fileSize", &context.file_size.to_string());
    insert("s3ObjectPath", &context.full_data_path);
    insert("uploadTime", &context.upload_time.to_rfc3339());
    insert("uploadedBy", &context.user_agent);
    metadata
}

pub fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
