//! # Gateway Core
//!
//! 接入网关的核心模块，提供基础数据结构、错误定义、请求上下文构建和通用工具。

pub mod context;
pub mod error;
pub mod models;
pub mod utils;

pub use context::{ContextRequest, ContextSettings, RequestContextBuilder};
pub use error::{GatewayError, Result};
pub use models::*;
