//! # 网关管理模块
//!
//! 配置加载与验证、日志初始化。

pub mod config;
pub mod logging;

pub use config::{ConfigValidator, GatewayConfig, QueueProvider};
pub use logging::{init_logging, LogFormat};
