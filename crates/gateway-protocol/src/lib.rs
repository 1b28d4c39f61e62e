//! # 协议模块
//!
//! 传输层协议实现：PROXY v2 解码、MLLP 分帧、HL7v2 字段访问、SOAP 请求检查、
//! 三种确认消息的构建，以及 MLLP 监听器。

pub mod ack;
pub mod hl7;
pub mod mllp;
pub mod proxy_protocol;
pub mod server;
pub mod soap;

pub use ack::{AckOutcome, AcknowledgementBuilder};
pub use hl7::{Hl7Message, MshHeader, ZntFields};
pub use mllp::MllpCodec;
pub use proxy_protocol::ProxyDecoded;
pub use server::{ConnectionInfo, Inbound, MllpProcessor, MllpServer, MllpServerConfig};
pub use soap::{SoapOperation, SoapRequest, SoapVersion};
