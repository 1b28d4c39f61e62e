//! SOAP请求检查
//!
//! 从PIX / PnR请求中提取构造响应所需的信息：SOAP版本、WS-Addressing头、
//! Body根元素，以及HL7v3的消息id和发送/接收设备id。

use gateway_core::{GatewayError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const SOAP11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
pub const HL7V3_NS: &str = "urn:hl7-org:v3";
pub const XDS_B_NS: &str = "urn:ihe:iti:xds-b:2007";

/// 支持的PIX请求根元素
pub const PIX_ROOTS: [&str; 3] = ["PRPA_IN201301UV02", "PRPA_IN201302UV02", "PRPA_IN201304UV02"];
pub const PNR_ROOT: &str = "ProvideAndRegisterDocumentSetRequest";

/// SOAP版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoapVersion {
    Soap11,
    Soap12,
}

impl SoapVersion {
    pub fn namespace(&self) -> &'static str {
        match self {
            SoapVersion::Soap11 => SOAP11_NS,
            SoapVersion::Soap12 => SOAP12_NS,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            SoapVersion::Soap11 => "text/xml; charset=utf-8",
            SoapVersion::Soap12 => "application/soap+xml; charset=utf-8",
        }
    }
}

/// SOAP事务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapOperation {
    Pix,
    Pnr,
}

/// HL7v3 实例标识 (II数据类型)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceId {
    pub root: Option<String>,
    pub extension: Option<String>,
}

/// 解析后的SOAP请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapRequest {
    pub version: SoapVersion,
    pub message_id: Option<String>,
    pub action: Option<String>,
    pub body_namespace: Option<String>,
    pub body_root: String,
    pub hl7_message_id: Option<InstanceId>,
    pub sender_ids: Vec<InstanceId>,
    pub receiver_ids: Vec<InstanceId>,
}

impl SoapRequest {
    /// 按Body根元素的命名空间和名称识别事务
    pub fn operation(&self) -> Option<SoapOperation> {
        match self.body_namespace.as_deref() {
            Some(HL7V3_NS) if PIX_ROOTS.contains(&self.body_root.as_str()) => {
                Some(SoapOperation::Pix)
            }
            Some(XDS_B_NS) if self.body_root == PNR_ROOT => Some(SoapOperation::Pnr),
            _ => None,
        }
    }
}

/// 解析SOAP信封
pub fn parse_request(xml: &str) -> Result<SoapRequest> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut version = None;
    let mut message_id = None;
    let mut action = None;
    let mut body_namespace = None;
    let mut body_root: Option<String> = None;
    let mut hl7_message_id = None;
    let mut sender_ids = Vec::new();
    let mut receiver_ids = Vec::new();

    // 当前元素路径（本地名）及各层是否属于WS-Addressing头
    let mut path: Vec<String> = Vec::new();
    let mut capture: Option<&'static str> = None;

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .map_err(|e| GatewayError::Soap(format!("Invalid XML: {}", e)))?;
        let namespace = match resolved {
            ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
            _ => None,
        };

        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = local_name(e);

                match path.len() {
                    0 => {
                        if name != "Envelope" {
                            return Err(GatewayError::Soap(format!(
                                "Expected SOAP Envelope, found {}",
                                name
                            )));
                        }
                        version = match namespace.as_deref() {
                            Some(SOAP11_NS) => Some(SoapVersion::Soap11),
                            Some(SOAP12_NS) => Some(SoapVersion::Soap12),
                            other => {
                                return Err(GatewayError::Soap(format!(
                                    "Unknown SOAP envelope namespace: {:?}",
                                    other
                                )))
                            }
                        };
                    }
                    2 if path[1] == "Header" && namespace.as_deref() == Some(WSA_NS) => {
                        capture = match name.as_str() {
                            "MessageID" => Some("MessageID"),
                            "Action" => Some("Action"),
                            _ => None,
                        };
                    }
                    2 if path[1] == "Body" && body_root.is_none() => {
                        body_namespace = namespace.clone();
                        body_root = Some(name.clone());
                    }
                    3 if path[1] == "Body" && name == "id" && hl7_message_id.is_none() => {
                        hl7_message_id = Some(instance_id(e)?);
                    }
                    _ if name == "id" && path.len() >= 4 && path[1] == "Body" => {
                        let parents = &path[path.len() - 2..];
                        if parents[1] == "device" {
                            match parents[0].as_str() {
                                "sender" => sender_ids.push(instance_id(e)?),
                                "receiver" => receiver_ids.push(instance_id(e)?),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }

                if !is_empty {
                    path.push(name);
                }
            }
            Event::Text(ref t) => {
                if let Some(target) = capture {
                    let text = t
                        .unescape()
                        .map_err(|e| GatewayError::Soap(format!("Invalid text: {}", e)))?
                        .trim()
                        .to_string();
                    match target {
                        "MessageID" => message_id = Some(text),
                        _ => action = Some(text),
                    }
                }
            }
            Event::End(_) => {
                capture = None;
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let version = version.ok_or_else(|| GatewayError::Soap("Missing SOAP Envelope".to_string()))?;
    let body_root =
        body_root.ok_or_else(|| GatewayError::Soap("SOAP Body is empty".to_string()))?;

    debug!(
        "Parsed SOAP request: version={:?}, root={}, message_id={:?}",
        version, body_root, message_id
    );

    Ok(SoapRequest {
        version,
        message_id,
        action,
        body_namespace,
        body_root,
        hl7_message_id,
        sender_ids,
        receiver_ids,
    })
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn instance_id(e: &BytesStart<'_>) -> Result<InstanceId> {
    let mut id = InstanceId::default();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| GatewayError::Soap(format!("Invalid attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| GatewayError::Soap(format!("Invalid attribute value: {}", e)))?
            .into_owned();
        match attr.key.local_name().as_ref() {
            b"root" => id.root = Some(value),
            b"extension" => id.extension = Some(value),
            _ => {}
        }
    }
    Ok(id)
}
