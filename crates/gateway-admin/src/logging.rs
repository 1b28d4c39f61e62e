//! 日志初始化
//!
//! `RUST_LOG` 存在时优先使用，否则使用命令行给出的级别。

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| anyhow!("Invalid log level {}: {}", level, e)),
    }
}

/// 初始化全局日志订阅者，进程内只调用一次
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = env_filter(level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("TEXT".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_env_filter_accepts_directives() {
        assert!(env_filter("info,gateway_integration=debug").is_ok());
    }
}
