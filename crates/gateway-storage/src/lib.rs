//! # 存储模块
//!
//! 负责原始消息、元数据和确认消息的对象存储写入。

pub mod storage;

pub use storage::*;
