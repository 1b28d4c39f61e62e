//! 通用工具函数

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// 生成交互标识符
pub fn generate_interaction_id() -> String {
    Uuid::new_v4().to_string()
}

/// 空白字符串视为缺失
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// 按名称查找请求头，不区分大小写，忽略空白值
pub fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| non_blank(Some(v.as_str())))
}

/// 日期分区路径 yyyy/MM/dd
pub fn date_partition(time: &DateTime<Utc>) -> String {
    time.format("%Y/%m/%d").to_string()
}

/// 在键前拼接可选目录前缀
pub fn with_prefix(prefix: Option<&str>, key: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{}/{}", p, key),
        None => key.to_string(),
    }
}

/// 对象完整路径 s3://bucket/key
pub fn full_object_path(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}
