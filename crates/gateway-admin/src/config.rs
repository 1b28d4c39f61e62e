//! 配置管理
//!
//! 配置来源按优先级从低到高：内置默认值 → TOML配置文件（可选）→ 环境变量。
//! 环境变量使用 `GATEWAY__` 前缀和双下划线分隔层级，例如
//! `GATEWAY__STORAGE__DATA_BUCKET`、`GATEWAY__MLLP__PORTS=2575,2576`。

use anyhow::{Context, Result};
use config::{Config, Environment, File, Source};
use gateway_core::{ContextSettings, MessageSourceType, PortOverride, DEFAULT_TENANT_ID};
use gateway_integration::{MessageQueueConfig, PersistenceTimeouts};
use gateway_protocol::MllpServerConfig;
use gateway_storage::StorageConfig;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{error, info};

const ENV_PREFIX: &str = "GATEWAY";
const ENV_SEPARATOR: &str = "__";

/// 网关完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP服务配置
    pub server: ServerConfig,
    /// 对象存储配置
    pub storage: StorageConfig,
    /// 消息队列配置
    pub queue: QueueConfig,
    /// MLLP监听配置
    pub mllp: MllpConfig,
    /// 租户配置
    pub tenants: TenantConfig,
    /// 各阶段超时（毫秒）
    pub timeouts: TimeoutConfig,
    /// 按端口的路由和路径前缀覆盖
    pub ports: Vec<PortOverride>,
}

/// HTTP服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 响应和确认消息中回显的版本号
    pub version: String,
    pub max_body_bytes: usize,
}

/// 队列后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueProvider {
    Amqp,
    Memory,
}

/// 消息队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub provider: QueueProvider,
    pub url: String,
    pub exchange: String,
    pub exchange_kind: String,
    pub heartbeat: u16,
    pub prefetch_count: u16,
}

/// MLLP监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MllpConfig {
    pub host: String,
    /// 监听端口，接受数组或逗号分隔的字符串
    #[serde(deserialize_with = "deserialize_ports")]
    pub ports: Vec<u16>,
    pub max_frame_bytes: usize,
    pub proxy_protocol: bool,
}

/// 租户配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub default_tenant: String,
    /// 来源类型（如 `MLLP`、`SOAP_PIX`）到默认租户
    pub sources: HashMap<String, String>,
}

/// 超时配置（毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub read: u64,
    pub blob_write: u64,
    pub enqueue: u64,
}

/// 配置验证规则
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&GatewayConfig) -> std::result::Result<(), String>,
}

/// 配置验证器
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

impl GatewayConfig {
    /// 从可选的配置文件和环境变量加载并验证
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config = Self::from_sources(config_path.map(File::with_name), environment())?;
        match config_path {
            Some(path) => info!("Configuration loaded from {} and environment", path),
            None => info!("Configuration loaded from environment"),
        }
        Ok(config)
    }

    fn from_sources<S>(file: Option<S>, env: Environment) -> Result<Self>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let settings = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration sources")?;

        let config: GatewayConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::new().validate(self)
    }

    /// 上下文构建器配置
    pub fn context_settings(&self) -> Result<ContextSettings> {
        let mut source_tenants = HashMap::new();
        for (source, tenant) in &self.tenants.sources {
            source_tenants.insert(parse_source_type(source)?, tenant.clone());
        }
        Ok(ContextSettings {
            data_bucket: self.storage.data_bucket.clone(),
            metadata_bucket: self.storage.metadata_bucket.clone(),
            default_tenant: self.tenants.default_tenant.clone(),
            source_tenants,
            port_overrides: self.ports.clone(),
            ingestion_api_version: self.server.version.clone(),
            ..ContextSettings::default()
        })
    }

    /// HTTP请求体和MLLP帧共用的读取时限
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.read)
    }

    pub fn persistence_timeouts(&self) -> PersistenceTimeouts {
        PersistenceTimeouts {
            blob_write: Duration::from_millis(self.timeouts.blob_write),
            enqueue: Duration::from_millis(self.timeouts.enqueue),
        }
    }

    pub fn queue_config(&self) -> MessageQueueConfig {
        MessageQueueConfig {
            url: self.queue.url.clone(),
            exchange: self.queue.exchange.clone(),
            exchange_kind: self.queue.exchange_kind.clone(),
            heartbeat: self.queue.heartbeat,
            prefetch_count: self.queue.prefetch_count,
        }
    }

    /// 每个MLLP端口一个监听器配置
    pub fn mllp_servers(&self) -> Vec<MllpServerConfig> {
        self.mllp
            .ports
            .iter()
            .map(|port| MllpServerConfig {
                host: self.mllp.host.clone(),
                port: *port,
                max_frame_bytes: self.mllp.max_frame_bytes,
                proxy_protocol: self.mllp.proxy_protocol,
                read_timeout: self.read_timeout(),
            })
            .collect()
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .list_separator(",")
        .with_list_parse_key("mllp.ports")
        .try_parsing(true)
}

fn parse_source_type(value: &str) -> Result<MessageSourceType> {
    MessageSourceType::ALL
        .into_iter()
        .find(|source| source.as_str().eq_ignore_ascii_case(value.trim()))
        .ok_or_else(|| anyhow::anyhow!("Unknown message source type: {}", value))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortItem {
    Number(u16),
    Text(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortsValue {
    List(Vec<PortItem>),
    Single(u16),
    Text(String),
}

fn deserialize_ports<'de, D>(deserializer: D) -> std::result::Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = match PortsValue::deserialize(deserializer)? {
        PortsValue::List(items) => items,
        PortsValue::Single(port) => vec![PortItem::Number(port)],
        PortsValue::Text(text) => vec![PortItem::Text(text)],
    };

    let mut ports = Vec::new();
    for item in items {
        match item {
            PortItem::Number(port) => ports.push(port),
            PortItem::Text(text) => {
                for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let port = part
                        .parse::<u16>()
                        .map_err(|_| de::Error::custom(format!("invalid MLLP port: {}", part)))?;
                    ports.push(port);
                }
            }
        }
    }
    Ok(ports)
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    if config.server.port == 0 {
                        Err("HTTP port cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "storage",
                validator: |config| {
                    if config.storage.data_bucket.trim().is_empty()
                        || config.storage.metadata_bucket.trim().is_empty()
                    {
                        Err("Bucket names cannot be empty".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "queue.url",
                validator: |config| {
                    if config.queue.provider == QueueProvider::Amqp && config.queue.url.trim().is_empty() {
                        Err("Queue URL cannot be empty".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "mllp.ports",
                validator: |config| {
                    let mut seen = HashSet::new();
                    for port in &config.mllp.ports {
                        if *port == 0 {
                            return Err("MLLP port cannot be 0".to_string());
                        }
                        if !seen.insert(*port) {
                            return Err(format!("Duplicate MLLP port {}", port));
                        }
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "timeouts",
                validator: |config| {
                    let t = &config.timeouts;
                    if t.read == 0 || t.blob_write == 0 || t.enqueue == 0 {
                        Err("Timeouts must be greater than 0".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "tenants.sources",
                validator: |config| {
                    for source in config.tenants.sources.keys() {
                        parse_source_type(source).map_err(|e| e.to_string())?;
                    }
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &GatewayConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("Invalid {}: {}", rule.field_path, e));
            }
        }
        info!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let amqp = MessageQueueConfig::default();
        Self {
            provider: QueueProvider::Memory,
            url: amqp.url,
            exchange: amqp.exchange,
            exchange_kind: amqp.exchange_kind,
            heartbeat: amqp.heartbeat,
            prefetch_count: amqp.prefetch_count,
        }
    }
}

impl Default for MllpConfig {
    fn default() -> Self {
        let server = MllpServerConfig::default();
        Self {
            host: server.host,
            ports: vec![server.port],
            max_frame_bytes: server.max_frame_bytes,
            proxy_protocol: server.proxy_protocol,
        }
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            default_tenant: DEFAULT_TENANT_ID.to_string(),
            sources: HashMap::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read: 30_000,
            blob_write: 30_000,
            enqueue: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use gateway_storage::StorageProvider;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<config::Map<String, String>>();
        environment().source(Some(map))
    }

    fn toml(text: &str) -> Option<File<config::FileSourceString, FileFormat>> {
        Some(File::from_str(text, FileFormat::Toml))
    }

    const NO_FILE: Option<File<config::FileSourceString, FileFormat>> = None;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::from_sources(NO_FILE, env(&[])).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mllp.ports, vec![2575]);
        assert_eq!(config.queue.provider, QueueProvider::Memory);
        assert_eq!(config.storage.provider, StorageProvider::Memory);
    }

    #[test]
    fn test_file_then_environment() {
        let file = toml(
            r#"
[storage]
provider = "s3"
data_bucket = "file-data"
metadata_bucket = "file-meta"
region = "us-east-2"

[mllp]
ports = [2575, 2576]

[tenants.sources]
MLLP = "nyec"

[[ports]]
port = 9090
route = "/hold"
data_dir = "hold"
"#,
        );
        let config = GatewayConfig::from_sources(
            file,
            env(&[("GATEWAY__STORAGE__DATA_BUCKET", "env-data")]),
        )
        .unwrap();

        assert_eq!(config.storage.data_bucket, "env-data");
        assert_eq!(config.storage.metadata_bucket, "file-meta");
        assert_eq!(config.mllp.ports, vec![2575, 2576]);
        assert_eq!(config.ports.len(), 1);
        assert!(config.ports[0].is_hold());

        let settings = config.context_settings().unwrap();
        assert_eq!(settings.source_tenants[&MessageSourceType::Mllp], "nyec");
        assert_eq!(settings.data_bucket, "env-data");
    }

    #[test]
    fn test_ports_from_comma_separated_env() {
        let config = GatewayConfig::from_sources(
            NO_FILE,
            env(&[("GATEWAY__MLLP__PORTS", "2575, 2576,2577")]),
        )
        .unwrap();
        assert_eq!(config.mllp.ports, vec![2575, 2576, 2577]);
        assert_eq!(config.mllp_servers().len(), 3);
        assert_eq!(config.mllp_servers()[1].port, 2576);
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let result = GatewayConfig::from_sources(
            NO_FILE,
            env(&[("GATEWAY__MLLP__PORTS", "2575,2575")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_bucket_and_zero_timeout() {
        let mut config = GatewayConfig::default();
        config.storage.data_bucket = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.timeouts.enqueue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_amqp_url() {
        let mut config = GatewayConfig::default();
        config.queue.url = String::new();
        assert!(config.validate().is_ok());
        config.queue.provider = QueueProvider::Amqp;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_source_tenant() {
        let mut config = GatewayConfig::default();
        config
            .tenants
            .sources
            .insert("FTP".to_string(), "x".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_mapping() {
        let config = GatewayConfig::default();
        let timeouts = config.persistence_timeouts();
        assert_eq!(timeouts.enqueue, Duration::from_millis(10_000));
        assert_eq!(config.mllp_servers()[0].read_timeout, Duration::from_secs(30));
        assert_eq!(config.read_timeout(), Duration::from_secs(30));
    }
}
